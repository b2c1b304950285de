//! Streaming service descriptors
//!
//! A [`ServiceDescriptor`] is the static description of one upstream
//! aggregator: where it lives, how long each extraction stage may take and
//! which extraction strategy applies to it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::defaults::*;
use crate::config::duration_serde;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Lower values are tried first
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub timeouts: StageTimeouts,
    pub strategy: StrategyConfig,
}

fn default_enabled() -> bool {
    true
}

/// Per-stage time budgets for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "default_page_timeout", with = "duration_serde::duration")]
    pub page: Duration,
    #[serde(default = "default_embed_timeout", with = "duration_serde::duration")]
    pub embed: Duration,
    #[serde(default = "default_browser_wait", with = "duration_serde::duration")]
    pub browser_wait: Duration,
    /// Budget for fetching the resolved playlist itself
    #[serde(default = "default_service_segment_timeout", with = "duration_serde::duration")]
    pub segment: Duration,
    /// Budget for one whole attempt against this service
    #[serde(default = "default_service_total_timeout", with = "duration_serde::duration")]
    pub total: Duration,
}

fn default_page_timeout() -> Duration {
    DEFAULT_PAGE_TIMEOUT
}

fn default_embed_timeout() -> Duration {
    DEFAULT_EMBED_TIMEOUT
}

fn default_browser_wait() -> Duration {
    DEFAULT_BROWSER_WAIT_TIMEOUT
}

fn default_service_segment_timeout() -> Duration {
    DEFAULT_SERVICE_SEGMENT_TIMEOUT
}

fn default_service_total_timeout() -> Duration {
    DEFAULT_SERVICE_TOTAL_TIMEOUT
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            page: default_page_timeout(),
            embed: default_embed_timeout(),
            browser_wait: default_browser_wait(),
            segment: default_service_segment_timeout(),
            total: default_service_total_timeout(),
        }
    }
}

/// The closed set of extraction strategies a service may use
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    EmbedScrape(EmbedScrapeConfig),
    LegacyAuthChain(LegacyAuthConfig),
}

impl StrategyConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyConfig::EmbedScrape(_) => "embed_scrape",
            StrategyConfig::LegacyAuthChain(_) => "legacy_auth_chain",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Page → embed → stream scrape, with an optional browser fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedScrapeConfig {
    /// Channel page URL; `{base}` and `{id}` are substituted
    #[serde(default = "default_page_template")]
    pub page_template: String,
    /// Alternate page URL for ids at least `long_id_min_len` characters long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_id_template: Option<String>,
    #[serde(default = "default_long_id_min_len")]
    pub long_id_min_len: usize,
    #[serde(default)]
    pub page_method: HttpMethod,
    /// Pattern locating the embed URL in the channel page. When the pattern
    /// has a capture group, group 1 is the URL.
    #[serde(default = "default_embed_pattern")]
    pub embed_pattern: String,
    /// Direct stream URL patterns, tried in order
    #[serde(default = "default_stream_patterns")]
    pub stream_patterns: Vec<String>,
    #[serde(default = "default_excluded_hosts")]
    pub excluded_hosts: Vec<String>,
    /// JavaScript variables that may hold the stream URL
    #[serde(default = "default_js_variables")]
    pub js_variables: Vec<String>,
    #[serde(default = "default_browser_ready_condition")]
    pub browser_ready_condition: String,
    /// Expression evaluated in the embed page; must yield the stream URL
    #[serde(default = "default_browser_probe_script")]
    pub browser_probe_script: String,
    /// Origin header sent alongside the Referer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

fn default_page_template() -> String {
    DEFAULT_PAGE_TEMPLATE.to_string()
}

fn default_long_id_min_len() -> usize {
    DEFAULT_LONG_ID_MIN_LEN
}

fn default_embed_pattern() -> String {
    DEFAULT_EMBED_PATTERN.to_string()
}

fn default_stream_patterns() -> Vec<String> {
    DEFAULT_STREAM_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_excluded_hosts() -> Vec<String> {
    DEFAULT_EXCLUDED_HOSTS.iter().map(|h| h.to_string()).collect()
}

fn default_js_variables() -> Vec<String> {
    DEFAULT_JS_VARIABLES.iter().map(|v| v.to_string()).collect()
}

fn default_browser_ready_condition() -> String {
    DEFAULT_BROWSER_READY_CONDITION.to_string()
}

fn default_browser_probe_script() -> String {
    DEFAULT_BROWSER_PROBE_SCRIPT.to_string()
}

impl Default for EmbedScrapeConfig {
    fn default() -> Self {
        Self {
            page_template: default_page_template(),
            long_id_template: None,
            long_id_min_len: default_long_id_min_len(),
            page_method: HttpMethod::Get,
            embed_pattern: default_embed_pattern(),
            stream_patterns: default_stream_patterns(),
            excluded_hosts: default_excluded_hosts(),
            js_variables: default_js_variables(),
            browser_ready_condition: default_browser_ready_condition(),
            browser_probe_script: default_browser_probe_script(),
            origin: None,
        }
    }
}

/// Signed multi-request authentication chain used by older deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyAuthConfig {
    #[serde(default = "default_iframe_template")]
    pub iframe_template: String,
    #[serde(default = "default_server_lookup_path")]
    pub server_lookup_path: String,
    /// Final stream URL; `{server_key}` and `{channel_key}` are substituted
    pub stream_template: String,
    /// Per-server-key replacements for `stream_template`
    #[serde(default)]
    pub server_overrides: HashMap<String, String>,
}

fn default_iframe_template() -> String {
    DEFAULT_IFRAME_TEMPLATE.to_string()
}

fn default_server_lookup_path() -> String {
    DEFAULT_SERVER_LOOKUP_PATH.to_string()
}

impl ServiceDescriptor {
    /// Template service written into a fresh config file
    pub fn example() -> Self {
        Self {
            name: "primary".to_string(),
            priority: 1,
            enabled: true,
            base_url: "https://streams.example.com".to_string(),
            timeouts: StageTimeouts::default(),
            strategy: StrategyConfig::EmbedScrape(EmbedScrapeConfig::default()),
        }
    }

    /// Base URL without a trailing slash
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Substitute `{name}` placeholders in a URL template
pub fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{{name}}}"), value)
        })
}
