use anyhow::{Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use defaults::*;

use crate::models::{Channel, ServiceDescriptor};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
    /// Static channel catalog. Empty means any channel id is passed through.
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix prepended to every proxy-relative path written into playlists
    #[serde(default)]
    pub public_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Rewrite segment URLs so content flows through this server
    #[serde(default = "default_proxy_content")]
    pub proxy_content: bool,
    /// Hex-encoded 32-byte key for opaque tokens; generated per process when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_key: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout", with = "duration_serde::duration")]
    pub connect_timeout: Duration,
    #[serde(default = "default_segment_timeout", with = "duration_serde::duration")]
    pub segment_timeout: Duration,
    #[serde(default = "default_key_timeout", with = "duration_serde::duration")]
    pub key_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl", with = "duration_serde::duration")]
    pub ttl: Duration,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Sessions that relay nothing for this long are torn down
    #[serde(default = "default_idle_timeout", with = "duration_serde::duration")]
    pub idle_timeout: Duration,
    #[serde(default = "default_sweep_interval", with = "duration_serde::duration")]
    pub sweep_interval: Duration,
    #[serde(default = "default_drain_timeout", with = "duration_serde::duration")]
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Upper bound on one channel resolution across all services
    #[serde(default = "default_aggregate_timeout", with = "duration_serde::duration")]
    pub aggregate_timeout: Duration,
    /// Retries of a transient stage failure, within the stage budget
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
    /// Consecutive failures after which a service is reported unhealthy
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// W3C WebDriver endpoint, e.g. `http://localhost:9515`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdriver_url: Option<String>,
    #[serde(default = "default_browser_name")]
    pub browser_name: String,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_browser_poll_interval", with = "duration_serde::duration")]
    pub poll_interval: Duration,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_proxy_content() -> bool {
    DEFAULT_PROXY_CONTENT
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_segment_timeout() -> Duration {
    DEFAULT_SEGMENT_TIMEOUT
}

fn default_key_timeout() -> Duration {
    DEFAULT_KEY_TIMEOUT
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_drain_timeout() -> Duration {
    DEFAULT_DRAIN_TIMEOUT
}

fn default_aggregate_timeout() -> Duration {
    DEFAULT_AGGREGATE_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_jitter_ms() -> u64 {
    DEFAULT_RETRY_JITTER_MS
}

fn default_unhealthy_after() -> u32 {
    DEFAULT_UNHEALTHY_AFTER
}

fn default_browser_name() -> String {
    DEFAULT_BROWSER_NAME.to_string()
}

fn default_browser_poll_interval() -> Duration {
    DEFAULT_BROWSER_POLL_INTERVAL
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_prefix: String::new(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_content: default_proxy_content(),
            token_key: None,
            user_agent: default_user_agent(),
            connect_timeout: default_connect_timeout(),
            segment_timeout: default_segment_timeout(),
            key_timeout: default_key_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            aggregate_timeout: default_aggregate_timeout(),
            max_retries: default_max_retries(),
            retry_jitter_ms: default_retry_jitter_ms(),
            unhealthy_after: default_unhealthy_after(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: None,
            browser_name: default_browser_name(),
            headless: true,
            extra_args: Vec::new(),
            poll_interval: default_browser_poll_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, writing defaults first when the
    /// file does not exist. `STREAM_RELAY_` environment variables override
    /// file values, with `__` separating nested keys
    /// (e.g. `STREAM_RELAY_CACHE__TTL=45s`).
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if !std::path::Path::new(config_file).exists() {
            let default_config = Self::with_example_service();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
        }

        let config: Config = Figment::new()
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("STREAM_RELAY_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with one enabled embed-scrape service, used as
    /// the template for a freshly written config file
    pub fn with_example_service() -> Self {
        Self {
            services: vec![ServiceDescriptor::example()],
            ..Self::default()
        }
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<()> {
        if self.governor.max_sessions == 0 {
            bail!("governor.max_sessions must be at least 1");
        }
        if self.cache.capacity == 0 {
            bail!("cache.capacity must be at least 1");
        }
        if let Some(key) = &self.proxy.token_key {
            match hex::decode(key) {
                Ok(bytes) if bytes.len() == 32 => {}
                Ok(bytes) => bail!(
                    "proxy.token_key must decode to 32 bytes, got {}",
                    bytes.len()
                ),
                Err(e) => bail!("proxy.token_key is not valid hex: {e}"),
            }
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                bail!("every service needs a non-empty name");
            }
            if !names.insert(service.name.as_str()) {
                bail!("duplicate service name '{}'", service.name);
            }
        }

        let mut channel_ids = HashSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.id.as_str()) {
                bail!("duplicate channel id '{}'", channel.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyConfig;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.web.port, DEFAULT_PORT);
        assert_eq!(config.cache.ttl, Duration::from_secs(30));
        assert_eq!(config.cache.capacity, 100);
        assert_eq!(config.governor.max_sessions, 10);
        assert!(config.proxy.proxy_content);
        assert!(config.services.is_empty());
    }

    #[test]
    fn parses_services_with_strategies() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            ttl = "45s"

            [[services]]
            name = "primary"
            priority = 1
            base_url = "https://one.example"

            [services.timeouts]
            page = "3s"

            [services.strategy]
            kind = "embed_scrape"
            long_id_template = "{base}/stream/bet.php?id=bet{id}"

            [[services]]
            name = "legacy"
            priority = 2
            enabled = false
            base_url = "https://two.example"

            [services.strategy]
            kind = "legacy_auth_chain"
            stream_template = "https://{server_key}.cdn.example/{server_key}/{channel_key}/mono.m3u8"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.ttl, Duration::from_secs(45));
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].timeouts.page, Duration::from_secs(3));
        assert!(matches!(
            config.services[0].strategy,
            StrategyConfig::EmbedScrape(_)
        ));
        assert!(!config.services[1].enabled);
        assert!(matches!(
            config.services[1].strategy,
            StrategyConfig::LegacyAuthChain(_)
        ));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let mut config = Config::with_example_service();
        config.services.push(ServiceDescriptor::example());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_short_token_key() {
        let mut config = Config::default();
        config.proxy.token_key = Some("abcd".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn example_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::with_example_service()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.services.len(), 1);
        parsed.validate().unwrap();
    }
}
