//! Page → embed → stream extraction
//!
//! Stages run strictly in order and each has its own budget:
//!
//! 1. fetch the channel page (URL shape chosen per service from the id)
//! 2. locate the embed reference in it; a miss fails the service
//! 3. fetch the embed page
//! 4. scan it for direct stream URLs, then for known script variables
//! 5. load the embed page in a browser and probe for the stream URL
//!
//! When stage 5 is unavailable or fails, the embed reference itself is
//! returned as a client-side result rather than an error.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{BrowserError, ExtractionError, ExtractionResult};
use crate::extraction::patterns::EmbedPatterns;
use crate::extraction::{ExtractionPipeline, PipelineDeps};
use crate::models::{
    Channel, EmbedScrapeConfig, ServiceDescriptor, StreamDescriptor, fill_template,
};
use crate::utils::http_client::{HttpRequest, StageFetcher};
use crate::utils::url::UrlUtils;

pub struct EmbedScrapePipeline {
    descriptor: ServiceDescriptor,
    config: EmbedScrapeConfig,
    patterns: EmbedPatterns,
    deps: PipelineDeps,
}

impl EmbedScrapePipeline {
    pub fn new(
        descriptor: ServiceDescriptor,
        config: EmbedScrapeConfig,
        deps: PipelineDeps,
    ) -> Result<Self, regex::Error> {
        let patterns = EmbedPatterns::compile(&config)?;
        Ok(Self {
            descriptor,
            config,
            patterns,
            deps,
        })
    }

    /// Channel page URL for an upstream id
    pub fn page_url(&self, upstream_id: &str) -> String {
        let template = match &self.config.long_id_template {
            Some(long) if upstream_id.chars().count() >= self.config.long_id_min_len => long,
            _ => &self.config.page_template,
        };
        fill_template(
            template,
            &[("base", self.descriptor.base()), ("id", upstream_id)],
        )
    }

    fn stage(&self) -> StageFetcher<'_> {
        StageFetcher::new(self.deps.fetcher.as_ref(), self.deps.retry)
    }

    async fn browser_fallback(&self, embed_url: &str) -> Result<String, BrowserError> {
        let browser = self
            .deps
            .browser
            .as_ref()
            .ok_or_else(|| BrowserError::Unavailable {
                message: "no browser capability configured".to_string(),
            })?;
        let budget = self.descriptor.timeouts.browser_wait;
        let deadline = Instant::now() + budget;

        // Session creation counts against the same budget as the wait
        let mut page = tokio::time::timeout_at(deadline, browser.open_page())
            .await
            .map_err(|_| BrowserError::Timeout { timeout: budget })??;
        let outcome = tokio::time::timeout_at(deadline, async {
            page.navigate(embed_url).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            page.wait_for(&self.config.browser_ready_condition, remaining)
                .await?;
            page.evaluate(&self.config.browser_probe_script).await
        })
        .await
        .unwrap_or(Err(BrowserError::Timeout { timeout: budget }));

        if let Err(e) = page.close().await {
            debug!("Failed to close browser page: {}", e);
        }

        let value = outcome?;
        value
            .as_str()
            .map(str::trim)
            .filter(|url| UrlUtils::is_http_url(url))
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Script {
                message: format!("probe returned no stream URL: {value}"),
            })
    }
}

#[async_trait]
impl ExtractionPipeline for EmbedScrapePipeline {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn extract(&self, channel: &Channel) -> ExtractionResult<StreamDescriptor> {
        let service = &self.descriptor.name;
        let timeouts = &self.descriptor.timeouts;
        let stage = self.stage();
        let origin_header = self.config.origin.as_deref();

        let page_url = self.page_url(channel.upstream_id());
        debug!(
            "[{}] channel {} page: {}",
            service,
            channel.id,
            UrlUtils::redact(&page_url)
        );
        let base_referer = format!("{}/", self.descriptor.base());
        let request = HttpRequest::new(self.config.page_method, &page_url)
            .referer(Some(&base_referer), origin_header);
        let page = stage.fetch("page", request, timeouts.page).await?;

        let embed_url = self
            .patterns
            .find_embed(&page.body, &page.final_url)
            .ok_or_else(|| ExtractionError::pattern_not_found("embed"))?;
        debug!(
            "[{}] channel {} embed: {}",
            service,
            channel.id,
            UrlUtils::redact(&embed_url)
        );

        let request = HttpRequest::get(&embed_url).referer(Some(&page_url), origin_header);
        let embed = stage.fetch("embed", request, timeouts.embed).await?;

        let embed_origin = UrlUtils::origin_of(&embed_url);
        let referer = embed_origin.as_ref().map(|origin| format!("{origin}/"));
        let origin = self.config.origin.clone().or_else(|| embed_origin.clone());
        let skip = [embed_url.as_str(), page_url.as_str()];

        let direct = self
            .patterns
            .find_streams(&embed.body, &skip)
            .into_iter()
            .next()
            .or_else(|| self.patterns.find_js_stream(&embed.body, &skip));
        if let Some(url) = direct {
            info!(
                "[{}] channel {} resolved from embed page: {}",
                service,
                channel.id,
                UrlUtils::redact(&url)
            );
            return Ok(StreamDescriptor::direct(&channel.id, url, referer, service).with_origin(origin));
        }

        match self.browser_fallback(&embed_url).await {
            Ok(url) => {
                info!(
                    "[{}] channel {} resolved by browser: {}",
                    service,
                    channel.id,
                    UrlUtils::redact(&url)
                );
                Ok(StreamDescriptor::direct(&channel.id, url, referer, service).with_origin(origin))
            }
            Err(e) => {
                warn!(
                    "[{}] channel {} degraded to client-side embed: {}",
                    service, channel.id, e
                );
                Ok(StreamDescriptor::client_side_embed(
                    &channel.id,
                    embed_url,
                    Some(page_url),
                    service,
                ))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable browser for pipeline tests

    use super::*;
    use crate::extraction::{BrowserAutomation, BrowserPage};
    use serde_json::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub struct FakeBrowser {
        result: Result<Value, BrowserError>,
        open_delay: Duration,
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
    }

    impl FakeBrowser {
        pub fn returning(result: Result<Value, BrowserError>) -> Self {
            Self {
                result,
                open_delay: Duration::ZERO,
                opened: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Session creation that hangs for `delay`
        pub fn slow_to_open(mut self, delay: Duration) -> Self {
            self.open_delay = delay;
            self
        }
    }

    struct FakePage {
        result: Result<Value, BrowserError>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserPage for FakePage {
        async fn navigate(&mut self, _url: &str) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn wait_for(&mut self, _condition: &str, _timeout: Duration) -> Result<(), BrowserError> {
            Ok(())
        }

        async fn evaluate(&mut self, _script: &str) -> Result<Value, BrowserError> {
            self.result.clone()
        }

        async fn close(&mut self) -> Result<(), BrowserError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl BrowserAutomation for FakeBrowser {
        async fn open_page(&self) -> Result<Box<dyn BrowserPage>, BrowserError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if !self.open_delay.is_zero() {
                tokio::time::sleep(self.open_delay).await;
            }
            Ok(Box::new(FakePage {
                result: self.result.clone(),
                closed: self.closed.clone(),
            }))
        }
    }
}
