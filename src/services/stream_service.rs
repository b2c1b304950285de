//! Core stream facade
//!
//! Glues catalog lookup, cached resolution, playlist fetching and rewriting,
//! and content relay together. The web layer talks only to this service.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{AppError, AppResult, FetchError, ProxyError, ResolveError};
use crate::extraction::{BrowserAutomation, PipelineDeps, ServiceRegistry, ServiceStatus};
use crate::models::{
    Channel, ChannelCatalog, PassthroughCatalog, StaticCatalog, StreamDescriptor,
};
use crate::proxy::{
    ContentProxy, OpaqueUrlCodec, PlaylistRewriter, RelayedContent, RewriteContext, TokenPayload,
    is_playlist,
};
use crate::services::concurrency_governor::{ConcurrencyGovernor, SessionInfo, SessionKind};
use crate::services::stream_cache::{CacheStats, StreamCache};
use crate::utils::http_client::{HttpFetcher, HttpRequest, RetryPolicy, StageFetcher};
use crate::utils::url::UrlUtils;

/// What the stream endpoint hands back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistResponse {
    /// Playlist text, rewritten where proxying applies
    Playlist(String),
    /// Send the client elsewhere
    Redirect(String),
}

/// Health surface
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub accepting_sessions: bool,
    pub proxy_content: bool,
    pub cache: CacheStats,
    pub services: Vec<ServiceStatus>,
}

/// Body served for a channel that only resolved to its embed page
pub fn degraded_playlist(descriptor: &StreamDescriptor) -> String {
    format!(
        "#EXTM3U\n#EXTINF:-1,{}\n{}\n",
        descriptor.service, descriptor.url
    )
}

fn fetch_to_proxy_error(error: FetchError) -> ProxyError {
    match error {
        FetchError::Timeout { url, .. } => ProxyError::Timeout {
            url: UrlUtils::redact(&url),
        },
        FetchError::Status { url, status } => ProxyError::Status {
            url: UrlUtils::redact(&url),
            status,
        },
        FetchError::Network { url, message } | FetchError::InvalidContent { url, message } => {
            ProxyError::Upstream {
                url: UrlUtils::redact(&url),
                message,
            }
        }
    }
}

pub struct StreamService {
    catalog: Arc<dyn ChannelCatalog>,
    registry: Arc<ServiceRegistry>,
    cache: Arc<StreamCache>,
    governor: ConcurrencyGovernor,
    rewriter: PlaylistRewriter,
    content: ContentProxy,
    fetcher: Arc<dyn HttpFetcher>,
    retry: RetryPolicy,
    nested_playlist_timeout: Duration,
}

impl StreamService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn ChannelCatalog>,
        registry: Arc<ServiceRegistry>,
        cache: Arc<StreamCache>,
        governor: ConcurrencyGovernor,
        rewriter: PlaylistRewriter,
        content: ContentProxy,
        fetcher: Arc<dyn HttpFetcher>,
        retry: RetryPolicy,
        nested_playlist_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            registry,
            cache,
            governor,
            rewriter,
            content,
            fetcher,
            retry,
            nested_playlist_timeout,
        }
    }

    /// Wire every component from configuration
    pub fn from_config(
        config: &Config,
        fetcher: Arc<dyn HttpFetcher>,
        browser: Option<Arc<dyn BrowserAutomation>>,
    ) -> AppResult<Self> {
        let codec = Arc::new(OpaqueUrlCodec::from_config(config.proxy.token_key.as_deref())?);
        if config.proxy.token_key.is_none() {
            warn!("No proxy.token_key configured, generated an ephemeral key; tokens will not survive a restart");
        }

        let retry = RetryPolicy {
            max_retries: config.resolution.max_retries,
            jitter_ms: config.resolution.retry_jitter_ms,
        };
        let deps = PipelineDeps::new(fetcher.clone())
            .with_browser(browser)
            .with_retry(retry);
        let registry =
            ServiceRegistry::from_descriptors(&config.services, &deps, &config.resolution)?;

        let capacity = NonZeroUsize::new(config.cache.capacity)
            .ok_or_else(|| AppError::configuration("cache.capacity must be at least 1"))?;
        let cache = StreamCache::new(config.cache.ttl, capacity);

        let catalog: Arc<dyn ChannelCatalog> = if config.channels.is_empty() {
            Arc::new(PassthroughCatalog)
        } else {
            Arc::new(StaticCatalog::new(config.channels.iter().cloned()))
        };

        let governor = ConcurrencyGovernor::new(&config.governor);
        let rewriter = PlaylistRewriter::new(
            codec.clone(),
            &config.web.public_prefix,
            config.proxy.proxy_content,
        );
        let content = ContentProxy::new(codec, governor.clone(), &config.proxy);

        info!(
            "Stream service ready: {} service(s), {} session cap, content proxying {}",
            registry.len(),
            governor.limit(),
            if config.proxy.proxy_content { "on" } else { "off" }
        );

        Ok(Self::new(
            catalog,
            Arc::new(registry),
            Arc::new(cache),
            governor,
            rewriter,
            content,
            fetcher,
            retry,
            config.proxy.segment_timeout,
        ))
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    async fn lookup_channel(&self, channel_id: &str) -> AppResult<Channel> {
        let channel = self.catalog.lookup(channel_id).await.ok_or_else(|| {
            ResolveError::UnknownChannel {
                channel_id: channel_id.to_string(),
            }
        })?;
        Ok(channel)
    }

    /// Resolve a channel through the cache, coalescing concurrent callers
    pub async fn resolve_stream(&self, channel_id: &str) -> AppResult<StreamDescriptor> {
        let channel = self.lookup_channel(channel_id).await?;
        let registry = &self.registry;
        let descriptor = self
            .cache
            .get_or_resolve(&channel.id, || async { registry.resolve(&channel).await })
            .await?;
        Ok(descriptor)
    }

    /// Resolve against one named service, bypassing the cache
    pub async fn resolve_with_service(
        &self,
        channel_id: &str,
        service: &str,
    ) -> AppResult<StreamDescriptor> {
        let channel = self.lookup_channel(channel_id).await?;
        info!("Resolving channel {} with service '{}' only", channel_id, service);
        Ok(self.registry.resolve_with(service, &channel).await?)
    }

    /// Playlist for a channel: degraded, redirected, or fetched and rewritten
    pub async fn playlist(&self, channel_id: &str) -> AppResult<PlaylistResponse> {
        let session = self.governor.admit(SessionKind::Playlist, Some(channel_id))?;
        let cancel = session.cancellation();
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Playlist session {} for channel {} cancelled", session.id(), channel_id);
                Err(ProxyError::Cancelled { session: session.id() }.into())
            }
            served = self.serve_playlist(channel_id) => served,
        }
    }

    async fn serve_playlist(&self, channel_id: &str) -> AppResult<PlaylistResponse> {
        let descriptor = self.resolve_stream(channel_id).await?;

        if descriptor.is_client_side() {
            warn!(
                "Serving degraded playlist for channel {} from '{}'",
                channel_id, descriptor.service
            );
            return Ok(PlaylistResponse::Playlist(degraded_playlist(&descriptor)));
        }
        if !self.rewriter.proxy_content() {
            return Ok(PlaylistResponse::Redirect(descriptor.url));
        }

        let budget = self
            .registry
            .descriptor(&descriptor.service)
            .map(|service| service.timeouts.segment)
            .unwrap_or(self.nested_playlist_timeout);
        let request = HttpRequest::get(&descriptor.url)
            .referer(descriptor.referer.as_deref(), descriptor.origin.as_deref());
        let response = match StageFetcher::new(self.fetcher.as_ref(), self.retry)
            .fetch("playlist", request, budget)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // A refused or unreachable stream URL must not stay cached
                if matches!(e, FetchError::Status { .. } | FetchError::Network { .. }) {
                    self.cache.invalidate(&descriptor.channel_id).await;
                }
                warn!(
                    "Playlist fetch for channel {} via '{}' failed: {}",
                    channel_id, descriptor.service, e
                );
                return Err(fetch_to_proxy_error(e).into());
            }
        };

        let context = RewriteContext::new(
            descriptor.referer_host.clone(),
            Some(descriptor.channel_id.clone()),
        )
        .with_base_url(&response.final_url);

        if !is_playlist(&response.body) {
            // Progressive media such as mp4 is relayed as plain content
            debug!(
                "Channel {} resolved to non-playlist content, redirecting to relay",
                channel_id
            );
            let location = self.rewriter.content_location(&descriptor.url, &context)?;
            return Ok(PlaylistResponse::Redirect(location));
        }

        let rewritten = self.rewriter.rewrite(&response.body, &context)?;
        info!(
            "Served playlist for channel {} via '{}'",
            channel_id, descriptor.service
        );
        Ok(PlaylistResponse::Playlist(rewritten))
    }

    /// Variant playlist referenced by a master playlist
    pub async fn nested_playlist(&self, token: &str) -> AppResult<String> {
        let payload = self.rewriter.codec().decode(token)?;
        let session = self
            .governor
            .admit(SessionKind::NestedPlaylist, payload.channel_id.as_deref())?;
        let cancel = session.cancellation();
        tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled { session: session.id() }.into()),
            served = self.serve_nested_playlist(payload) => served,
        }
    }

    async fn serve_nested_playlist(&self, payload: TokenPayload) -> AppResult<String> {
        let (referer, origin) = match payload.referer_host.as_deref() {
            Some(host) if !host.is_empty() => {
                let (referer, origin) = UrlUtils::referer_headers_for_host(host);
                (Some(referer), Some(origin))
            }
            _ => (None, None),
        };
        let request = HttpRequest::get(&payload.url).referer(referer.as_deref(), origin.as_deref());
        let response = StageFetcher::new(self.fetcher.as_ref(), self.retry)
            .fetch("nested_playlist", request, self.nested_playlist_timeout)
            .await
            .map_err(fetch_to_proxy_error)?;

        if !is_playlist(&response.body) {
            return Err(ProxyError::Upstream {
                url: UrlUtils::redact(&payload.url),
                message: "response is not an HLS playlist".to_string(),
            }
            .into());
        }

        let context = RewriteContext::new(payload.referer_host, payload.channel_id)
            .with_base_url(&response.final_url);
        Ok(self.rewriter.rewrite(&response.body, &context)?)
    }

    pub async fn stream_content(&self, token: &str, range: Option<&str>) -> AppResult<RelayedContent> {
        self.content.stream_content(token, range).await
    }

    pub async fn fetch_key(&self, key_token: &str, referer_token: &str) -> AppResult<Bytes> {
        self.content.fetch_key(key_token, referer_token).await
    }

    pub async fn health(&self) -> HealthReport {
        let services = self.registry.statuses();
        let usable = services.iter().any(|s| s.enabled && s.healthy);
        HealthReport {
            status: if usable { "healthy" } else { "degraded" },
            active_sessions: self.governor.active_count(),
            max_sessions: self.governor.limit(),
            accepting_sessions: !self.governor.is_closing(),
            proxy_content: self.rewriter.proxy_content(),
            cache: self.cache.stats().await,
            services,
        }
    }

    pub fn services(&self) -> Vec<ServiceStatus> {
        self.registry.statuses()
    }

    pub fn set_service_enabled(&self, name: &str, enabled: bool) -> AppResult<ServiceStatus> {
        if !self.registry.set_enabled(name, enabled) {
            return Err(AppError::not_found("service", name));
        }
        self.registry
            .statuses()
            .into_iter()
            .find(|status| status.name == name)
            .ok_or_else(|| AppError::not_found("service", name))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.governor.sessions()
    }

    pub async fn invalidate(&self, channel_id: &str) -> bool {
        self.cache.invalidate(channel_id).await
    }

    pub async fn clear_cache(&self) -> usize {
        self.cache.clear().await
    }
}
