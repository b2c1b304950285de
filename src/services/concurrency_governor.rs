//! Admission control and session bookkeeping
//!
//! Every client-facing relay (playlist, segment, key) runs inside a session
//! admitted here. The governor never queues: when all permits are taken a
//! new session is rejected immediately. A [`SessionGuard`] holds the permit
//! and releases it, along with the session record, when dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GovernorConfig;
use crate::errors::AdmissionError;
use crate::utils::human_format::{format_bytes, format_duration_secs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionKind {
    Playlist,
    NestedPlaylist,
    Segment,
    Key,
}

#[derive(Debug)]
struct SessionState {
    kind: SessionKind,
    channel_id: Option<String>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    last_activity: Instant,
    bytes_relayed: u64,
    chunks_relayed: u64,
    cancel: CancellationToken,
}

/// Snapshot of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub kind: SessionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration: String,
    pub idle_seconds: u64,
    pub bytes_relayed: u64,
    pub bytes_formatted: String,
}

struct GovernorInner {
    permits: Arc<Semaphore>,
    limit: usize,
    sessions: Mutex<HashMap<Uuid, SessionState>>,
    closing: AtomicBool,
    idle_timeout: Duration,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl GovernorInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, SessionState>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

#[derive(Clone)]
pub struct ConcurrencyGovernor {
    inner: Arc<GovernorInner>,
}

impl ConcurrencyGovernor {
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            inner: Arc::new(GovernorInner {
                permits: Arc::new(Semaphore::new(config.max_sessions)),
                limit: config.max_sessions,
                sessions: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
                idle_timeout: config.idle_timeout,
                sweep_interval: config.sweep_interval,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Admit a new session or fail fast
    pub fn admit(
        &self,
        kind: SessionKind,
        channel_id: Option<&str>,
    ) -> Result<SessionGuard, AdmissionError> {
        let inner = &self.inner;
        if inner.closing.load(Ordering::Acquire) {
            return Err(AdmissionError::ShuttingDown);
        }

        let permit = inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                let active = inner.active();
                warn!(
                    "Rejected {} session for {}: {}/{} sessions active",
                    kind,
                    channel_id.unwrap_or("-"),
                    active,
                    inner.limit
                );
                AdmissionError::Rejected {
                    active,
                    limit: inner.limit,
                }
            })?;

        let id = Uuid::new_v4();
        let cancel = inner.shutdown.child_token();
        let now = Instant::now();
        inner.sessions().insert(
            id,
            SessionState {
                kind,
                channel_id: channel_id.map(str::to_string),
                started_at: now,
                started_wall: Utc::now(),
                last_activity: now,
                bytes_relayed: 0,
                chunks_relayed: 0,
                cancel: cancel.clone(),
            },
        );
        debug!(
            "Admitted {} session {} for {} ({}/{})",
            kind,
            id,
            channel_id.unwrap_or("-"),
            inner.active(),
            inner.limit
        );

        Ok(SessionGuard {
            id,
            inner: self.inner.clone(),
            cancel,
            _permit: permit,
        })
    }

    pub fn active_count(&self) -> usize {
        self.inner.active()
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions()
            .iter()
            .map(|(id, state)| SessionInfo {
                id: *id,
                kind: state.kind,
                channel_id: state.channel_id.clone(),
                started_at: state.started_wall,
                duration: format_duration_secs(now.duration_since(state.started_at).as_secs()),
                idle_seconds: now.duration_since(state.last_activity).as_secs(),
                bytes_relayed: state.bytes_relayed,
                bytes_formatted: format_bytes(state.bytes_relayed),
            })
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Cancel sessions that have relayed nothing for longer than the idle
    /// timeout. Their permits return once the owning relay observes the
    /// cancellation and drops its guard.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.inner.idle_timeout;
        let sessions = self.inner.sessions();
        let mut reaped = 0;
        for (id, state) in sessions.iter() {
            if state.cancel.is_cancelled() {
                continue;
            }
            let idle = now.duration_since(state.last_activity);
            if idle >= idle_timeout {
                info!(
                    "Cancelling idle {} session {} (idle {}s)",
                    state.kind,
                    id,
                    idle.as_secs()
                );
                state.cancel.cancel();
                reaped += 1;
            }
        }
        reaped
    }

    /// Periodically reap idle sessions until shutdown
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let governor = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = governor.reap_idle();
                        if reaped > 0 {
                            debug!("Idle sweep cancelled {} sessions", reaped);
                        }
                    }
                }
            }
            debug!("Session reaper stopped");
        })
    }

    /// Refuse new sessions, cancel live ones and wait for them to finish.
    /// Returns true when every session drained within `drain_timeout`.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        self.inner.closing.store(true, Ordering::Release);
        let active = self.active_count();
        info!(
            "Draining {} active sessions (timeout {:?})",
            active, drain_timeout
        );
        self.inner.shutdown.cancel();

        let deadline = Instant::now() + drain_timeout;
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "{} sessions still active after drain timeout",
                    self.active_count()
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("All sessions drained");
        true
    }
}

/// Admitted session; dropping it ends the session
pub struct SessionGuard {
    id: Uuid,
    inner: Arc<GovernorInner>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled on idle timeout and shutdown
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn record_bytes(&self, bytes: u64) {
        if let Some(state) = self.inner.sessions().get_mut(&self.id) {
            state.bytes_relayed += bytes;
            state.chunks_relayed += 1;
            state.last_activity = Instant::now();
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(state) = self.inner.sessions().remove(&self.id) {
            let elapsed = state.started_at.elapsed().as_secs();
            debug!(
                "Session ended: {} | {} | Channel: {} | Duration: {} | Data: {} | Chunks: {}",
                self.id,
                state.kind,
                state.channel_id.as_deref().unwrap_or("-"),
                format_duration_secs(elapsed),
                format_bytes(state.bytes_relayed),
                state.chunks_relayed
            );
        }
    }
}
