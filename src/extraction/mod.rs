//! Stream extraction
//!
//! Each upstream service is driven by one [`ExtractionPipeline`]. The set of
//! pipelines is closed: a service descriptor selects one of the
//! [`StrategyConfig`] variants and [`build_pipeline`] turns it into the
//! matching implementation. The [`registry::ServiceRegistry`] composes them
//! into a priority-ordered failover chain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{AppError, AppResult, ExtractionResult};
use crate::models::{Channel, ServiceDescriptor, StrategyConfig, StreamDescriptor};
use crate::utils::http_client::{HttpFetcher, RetryPolicy};

pub mod browser;
pub mod embed_scrape;
pub mod legacy_auth;
pub mod patterns;
pub mod registry;

pub use browser::{BrowserAutomation, BrowserPage, WebDriverBrowser};
pub use embed_scrape::EmbedScrapePipeline;
pub use legacy_auth::LegacyAuthPipeline;
pub use registry::{ServiceHealth, ServiceRegistry, ServiceStatus};

/// Turns a channel into a playable stream for one upstream service
#[async_trait]
pub trait ExtractionPipeline: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    async fn extract(&self, channel: &Channel) -> ExtractionResult<StreamDescriptor>;
}

/// Capabilities shared by every pipeline
#[derive(Clone)]
pub struct PipelineDeps {
    pub fetcher: Arc<dyn HttpFetcher>,
    pub browser: Option<Arc<dyn BrowserAutomation>>,
    pub retry: RetryPolicy,
}

impl PipelineDeps {
    pub fn new(fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self {
            fetcher,
            browser: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_browser(mut self, browser: Option<Arc<dyn BrowserAutomation>>) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub fn build_pipeline(
    descriptor: ServiceDescriptor,
    deps: &PipelineDeps,
) -> AppResult<Box<dyn ExtractionPipeline>> {
    let name = descriptor.name.clone();
    let invalid = |e: regex::Error| {
        AppError::configuration(format!("service '{name}' has an invalid pattern: {e}"))
    };

    let pipeline: Box<dyn ExtractionPipeline> = match descriptor.strategy.clone() {
        StrategyConfig::EmbedScrape(config) => {
            Box::new(EmbedScrapePipeline::new(descriptor, config, deps.clone()).map_err(invalid)?)
        }
        StrategyConfig::LegacyAuthChain(config) => {
            Box::new(LegacyAuthPipeline::new(descriptor, config, deps.clone()).map_err(invalid)?)
        }
    };
    Ok(pipeline)
}
