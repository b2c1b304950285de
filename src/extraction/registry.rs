//! Priority-ordered service failover
//!
//! The registry owns one pipeline per configured service and tries the
//! enabled ones in ascending priority until one produces a stream. Health is
//! tracked per service with atomics so the status surface can be read while
//! resolutions are running.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResolutionConfig;
use crate::errors::{AppResult, ExtractionError, ResolveError, ResolveResult};
use crate::extraction::{ExtractionPipeline, PipelineDeps, build_pipeline};
use crate::models::{Channel, ServiceDescriptor, StreamDescriptor};

/// Live counters for one service
#[derive(Debug)]
pub struct ServiceHealth {
    enabled: AtomicBool,
    successes: AtomicU64,
    failures: AtomicU64,
    degraded: AtomicU64,
    consecutive_failures: AtomicU32,
    total_response_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl ServiceHealth {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            total_response_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_success: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn record_success(&self, elapsed: Duration, degraded: bool) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.total_response_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.lock() {
            *last = Some(Utc::now());
        }
    }

    fn record_failure(&self, elapsed: Duration, error: &ExtractionError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.total_response_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }
}

/// Serializable snapshot of a service for the health surface
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub priority: u32,
    pub strategy: &'static str,
    pub base_url: String,
    pub enabled: bool,
    pub healthy: bool,
    pub successes: u64,
    pub failures: u64,
    pub degraded: u64,
    pub consecutive_failures: u32,
    pub average_response_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
}

struct ServiceEntry {
    pipeline: Box<dyn ExtractionPipeline>,
    health: Arc<ServiceHealth>,
}

impl ServiceEntry {
    fn name(&self) -> &str {
        &self.pipeline.descriptor().name
    }
}

pub struct ServiceRegistry {
    entries: Vec<ServiceEntry>,
    aggregate_timeout: Duration,
    unhealthy_after: u32,
}

impl ServiceRegistry {
    pub fn new(
        pipelines: Vec<Box<dyn ExtractionPipeline>>,
        aggregate_timeout: Duration,
        unhealthy_after: u32,
    ) -> Self {
        let mut entries: Vec<ServiceEntry> = pipelines
            .into_iter()
            .map(|pipeline| {
                let health = Arc::new(ServiceHealth::new(pipeline.descriptor().enabled));
                ServiceEntry { pipeline, health }
            })
            .collect();
        entries.sort_by_key(|entry| entry.pipeline.descriptor().priority);

        Self {
            entries,
            aggregate_timeout,
            unhealthy_after,
        }
    }

    /// Build a pipeline for every configured service
    pub fn from_descriptors(
        descriptors: &[ServiceDescriptor],
        deps: &PipelineDeps,
        config: &ResolutionConfig,
    ) -> AppResult<Self> {
        let pipelines = descriptors
            .iter()
            .cloned()
            .map(|descriptor| build_pipeline(descriptor, deps))
            .collect::<AppResult<Vec<_>>>()?;

        let registry = Self::new(pipelines, config.aggregate_timeout, config.unhealthy_after);
        for entry in &registry.entries {
            let descriptor = entry.pipeline.descriptor();
            info!(
                "Registered service '{}' (priority {}, {}, {})",
                descriptor.name,
                descriptor.priority,
                descriptor.strategy.kind(),
                if descriptor.enabled { "enabled" } else { "disabled" }
            );
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Try enabled services in priority order; the first success wins
    pub async fn resolve(&self, channel: &Channel) -> ResolveResult<StreamDescriptor> {
        let enabled: Vec<&ServiceEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.health.is_enabled())
            .collect();
        if enabled.is_empty() {
            return Err(ResolveError::NoServicesEnabled);
        }
        self.within_deadline(channel, &enabled).await
    }

    /// Run exactly one named service, ignoring its enable flag. Health is
    /// recorded as for a normal resolution.
    pub async fn resolve_with(
        &self,
        name: &str,
        channel: &Channel,
    ) -> ResolveResult<StreamDescriptor> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name() == name)
            .ok_or_else(|| ResolveError::UnknownService {
                name: name.to_string(),
            })?;
        if !entry.health.is_enabled() {
            debug!("Resolving channel {} with disabled service '{}'", channel.id, name);
        }
        self.within_deadline(channel, &[entry]).await
    }

    async fn within_deadline(
        &self,
        channel: &Channel,
        services: &[&ServiceEntry],
    ) -> ResolveResult<StreamDescriptor> {
        match tokio::time::timeout(self.aggregate_timeout, self.failover(channel, services)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Resolution of channel {} exceeded the aggregate deadline of {:?}",
                    channel.id, self.aggregate_timeout
                );
                Err(ResolveError::DeadlineExceeded {
                    channel_id: channel.id.clone(),
                    deadline: self.aggregate_timeout,
                })
            }
        }
    }

    async fn failover(
        &self,
        channel: &Channel,
        services: &[&ServiceEntry],
    ) -> ResolveResult<StreamDescriptor> {
        let mut last_error = String::new();

        for (attempt, entry) in services.iter().enumerate() {
            let descriptor = entry.pipeline.descriptor();
            let budget = descriptor.timeouts.total;
            debug!(
                "Trying service '{}' for channel {} (attempt {}/{})",
                descriptor.name,
                channel.id,
                attempt + 1,
                services.len()
            );

            let started = Instant::now();
            let outcome = match tokio::time::timeout(budget, entry.pipeline.extract(channel)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ExtractionError::ServiceTimeout {
                    service: descriptor.name.clone(),
                    timeout: budget,
                }),
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(stream) => {
                    entry.health.record_success(elapsed, stream.is_client_side());
                    info!(
                        "Channel {} ({}) resolved by '{}' in {}ms ({})",
                        channel.id,
                        channel.name.as_deref().unwrap_or("unnamed"),
                        descriptor.name,
                        elapsed.as_millis(),
                        stream.kind
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    entry.health.record_failure(elapsed, &e);
                    warn!(
                        "Service '{}' failed for channel {}: {}",
                        descriptor.name, channel.id, e
                    );
                    last_error = format!("{}: {}", descriptor.name, e);
                }
            }
        }

        Err(ResolveError::AllServicesExhausted {
            channel_id: channel.id.clone(),
            attempts: services.len(),
            last_error,
        })
    }

    /// Returns false when no service has that name
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.iter().find(|entry| entry.name() == name) {
            Some(entry) => {
                entry.health.set_enabled(enabled);
                info!(
                    "Service '{}' {}",
                    name,
                    if enabled { "enabled" } else { "disabled" }
                );
                true
            }
            None => false,
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.entries
            .iter()
            .find(|entry| entry.name() == name)
            .map(|entry| entry.pipeline.descriptor())
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.entries
            .iter()
            .map(|entry| {
                let descriptor = entry.pipeline.descriptor();
                let health = &entry.health;
                let successes = health.successes.load(Ordering::Relaxed);
                let failures = health.failures.load(Ordering::Relaxed);
                let attempts = successes + failures;
                let consecutive_failures = health.consecutive_failures();

                ServiceStatus {
                    name: descriptor.name.clone(),
                    priority: descriptor.priority,
                    strategy: descriptor.strategy.kind(),
                    base_url: descriptor.base_url.clone(),
                    enabled: health.is_enabled(),
                    healthy: consecutive_failures < self.unhealthy_after,
                    successes,
                    failures,
                    degraded: health.degraded.load(Ordering::Relaxed),
                    consecutive_failures,
                    average_response_ms: if attempts > 0 {
                        health.total_response_ms.load(Ordering::Relaxed) / attempts
                    } else {
                        0
                    },
                    last_error: health.last_error.lock().ok().and_then(|e| e.clone()),
                    last_success: health.last_success.lock().ok().and_then(|s| *s),
                }
            })
            .collect()
    }
}
