//! Signed authentication chain used by older upstream deployments
//!
//! The player page exposes a channel key plus a handful of base64-encoded
//! script variables. Together they form a signed auth request; once that is
//! accepted, a server lookup names the edge that carries the stream.
//!
//! Only services whose descriptor selects `legacy_auth_chain` ever run this.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::errors::{ExtractionError, ExtractionResult};
use crate::extraction::{ExtractionPipeline, PipelineDeps};
use crate::models::{
    Channel, HttpMethod, LegacyAuthConfig, ServiceDescriptor, StreamDescriptor, fill_template,
};
use crate::utils::http_client::{HttpRequest, StageFetcher};
use crate::utils::url::UrlUtils;

/// Script variables carrying the auth parameters
struct AuthVariables {
    url: String,
    path: String,
    timestamp: String,
    random: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct ServerLookup {
    server_key: String,
}

pub struct LegacyAuthPipeline {
    descriptor: ServiceDescriptor,
    config: LegacyAuthConfig,
    deps: PipelineDeps,
    channel_key: Regex,
    atob_assignment: Regex,
}

impl LegacyAuthPipeline {
    pub fn new(
        descriptor: ServiceDescriptor,
        config: LegacyAuthConfig,
        deps: PipelineDeps,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            descriptor,
            config,
            deps,
            channel_key: Regex::new(r#"var\s+channelKey\s*=\s*"([^"]*)";"#)?,
            atob_assignment: atob_assignment_pattern()?,
        })
    }

    fn stage(&self) -> StageFetcher<'_> {
        StageFetcher::new(self.deps.fetcher.as_ref(), self.deps.retry)
    }

    /// Last assignment wins, matching how the page script executes
    fn extract_channel_key(&self, html: &str) -> Option<String> {
        self.channel_key
            .captures_iter(html)
            .last()
            .map(|c| c[1].to_string())
            .filter(|key| !key.is_empty())
    }

    fn extract_auth_variables(&self, html: &str) -> ExtractionResult<AuthVariables> {
        let var = |name: &str| {
            decode_atob_variable(&self.atob_assignment, html, name)
                .ok_or_else(|| ExtractionError::pattern_not_found(format!("auth variable {name}")))
        };
        Ok(AuthVariables {
            timestamp: var("__c")?,
            signature: var("__e")?,
            path: var("__b")?,
            random: var("__d")?,
            url: var("__a")?,
        })
    }

    fn auth_request_url(vars: &AuthVariables, channel_key: &str) -> ExtractionResult<String> {
        let mut url = Url::parse(&format!("{}{}", vars.url, vars.path)).map_err(|e| {
            ExtractionError::invalid_response(format!("auth endpoint is not a URL: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("channel_id", channel_key)
            .append_pair("ts", &vars.timestamp)
            .append_pair("rnd", &vars.random)
            .append_pair("sig", &vars.signature);
        Ok(url.to_string())
    }

    fn stream_url(&self, server_key: &str, channel_key: &str) -> String {
        let template = self
            .config
            .server_overrides
            .get(server_key)
            .unwrap_or(&self.config.stream_template);
        fill_template(
            template,
            &[("server_key", server_key), ("channel_key", channel_key)],
        )
    }
}

/// Matches `var NAME = atob("...");` with the name and encoded value captured
fn atob_assignment_pattern() -> Result<Regex, regex::Error> {
    Regex::new(r#"var\s+([A-Za-z_$][\w$]*)\s*=\s*atob\("([^"]+)"\);"#)
}

/// Last `atob` assignment to `name`, base64-decoded
fn decode_atob_variable(pattern: &Regex, html: &str, name: &str) -> Option<String> {
    let encoded = pattern
        .captures_iter(html)
        .filter(|c| &c[1] == name)
        .last()?
        .get(2)?
        .as_str();
    let bytes = STANDARD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl ExtractionPipeline for LegacyAuthPipeline {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn extract(&self, channel: &Channel) -> ExtractionResult<StreamDescriptor> {
        let service = &self.descriptor.name;
        let timeouts = &self.descriptor.timeouts;
        let stage = self.stage();

        let iframe_url = fill_template(
            &self.config.iframe_template,
            &[("base", self.descriptor.base()), ("id", channel.upstream_id())],
        );
        let iframe_origin = UrlUtils::origin_of(&iframe_url).ok_or_else(|| {
            ExtractionError::invalid_response(format!("iframe URL is not absolute: {iframe_url}"))
        })?;
        let referer = format!("{iframe_origin}/");

        let base_referer = format!("{}/", self.descriptor.base());
        let request = HttpRequest::new(HttpMethod::Post, &iframe_url).referer(Some(&base_referer), None);
        let page = stage.fetch("iframe", request, timeouts.page).await?;

        let channel_key = self
            .extract_channel_key(&page.body)
            .ok_or_else(|| ExtractionError::pattern_not_found("channel key"))?;
        let vars = self.extract_auth_variables(&page.body)?;
        debug!("[{}] channel {} key {}", service, channel.id, channel_key);

        let auth_url = Self::auth_request_url(&vars, &channel_key)?;
        let request = HttpRequest::get(&auth_url).referer(Some(&referer), Some(&iframe_origin));
        stage.fetch("auth", request, timeouts.embed).await?;

        let mut lookup_url = Url::parse(&iframe_origin)
            .and_then(|origin| origin.join(&self.config.server_lookup_path))
            .map_err(|e| ExtractionError::invalid_response(format!("bad lookup path: {e}")))?;
        lookup_url
            .query_pairs_mut()
            .append_pair("channel_id", &channel_key);
        let request = HttpRequest::get(lookup_url.as_str())
            .referer(Some(&referer), Some(&iframe_origin));
        let lookup = stage.fetch("server_lookup", request, timeouts.embed).await?;

        let server: ServerLookup = serde_json::from_str(&lookup.body).map_err(|e| {
            ExtractionError::invalid_response(format!("server lookup is not valid JSON: {e}"))
        })?;
        if server.server_key.trim().is_empty() {
            return Err(ExtractionError::invalid_response("server lookup returned no key"));
        }

        let url = self.stream_url(&server.server_key, &channel_key);
        info!(
            "[{}] channel {} resolved via auth chain on server {}",
            service, channel.id, server.server_key
        );
        Ok(StreamDescriptor::direct(&channel.id, url, Some(referer), service)
            .with_origin(Some(iframe_origin)))
    }
}
