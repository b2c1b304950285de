/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
use std::time::Duration;

// Web server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

// Proxy defaults
pub const DEFAULT_PROXY_CONTENT: bool = true;
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:137.0) Gecko/20100101 Firefox/137.0";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEY_TIMEOUT: Duration = Duration::from_secs(5);

// Stream cache defaults
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

// Concurrency governor defaults
pub const DEFAULT_MAX_SESSIONS: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// Resolution defaults
pub const DEFAULT_AGGREGATE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_JITTER_MS: u64 = 250;
pub const DEFAULT_UNHEALTHY_AFTER: u32 = 3;

// Per-service stage timeouts
pub const DEFAULT_PAGE_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_BROWSER_WAIT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_SERVICE_SEGMENT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SERVICE_TOTAL_TIMEOUT: Duration = Duration::from_secs(40);

// Embed scrape strategy defaults
pub const DEFAULT_PAGE_TEMPLATE: &str = "{base}/stream/stream-{id}.php";
pub const DEFAULT_LONG_ID_MIN_LEN: usize = 4;
pub const DEFAULT_EMBED_PATTERN: &str = r#"<iframe[^>]+src=["'](https?://[^"']+)["']"#;
pub const DEFAULT_STREAM_PATTERNS: &[&str] = &[
    r#"https?://[^"'\s<>]*\.m3u8[^"'\s<>]*"#,
    r#"https?://[^"'\s<>]*\.mp4[^"'\s<>]*"#,
    r#"https?://[^"'\s<>]*stream[^"'\s<>]*"#,
    r#"https?://[^"'\s<>]*cdn[^"'\s<>]*"#,
];
pub const DEFAULT_EXCLUDED_HOSTS: &[&str] = &["cdnjs.cloudflare.com"];
pub const DEFAULT_JS_VARIABLES: &[&str] = &["streamUrl", "videoUrl", "src", "url"];
pub const DEFAULT_BROWSER_READY_CONDITION: &str = "document.readyState === 'complete'";
pub const DEFAULT_BROWSER_PROBE_SCRIPT: &str = "(() => { \
    const hit = performance.getEntriesByType('resource').map(e => e.name) \
        .find(n => n.includes('.m3u8')); \
    if (hit) return hit; \
    const video = document.querySelector('video'); \
    if (video && (video.currentSrc || video.src)) return video.currentSrc || video.src; \
    return window.streamUrl || window.videoUrl || window.source || null; \
})()";

// Legacy auth chain defaults
pub const DEFAULT_IFRAME_TEMPLATE: &str = "{base}/premiumtv/daddylivehd.php?id={id}";
pub const DEFAULT_SERVER_LOOKUP_PATH: &str = "/server_lookup.php";

// Browser defaults
pub const DEFAULT_BROWSER_NAME: &str = "chrome";
pub const DEFAULT_BROWSER_POLL_INTERVAL: Duration = Duration::from_millis(250);
