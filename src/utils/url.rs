//! URL utilities for consistent URL handling
//!
//! Upstream URLs regularly carry signed query strings, so anything destined
//! for a log line goes through [`UrlUtils::redact`] first.

use url::Url;

/// URL utilities for consistent URL handling
pub struct UrlUtils;

impl UrlUtils {
    /// Whether the string is an absolute `http://` or `https://` URL
    ///
    /// ```rust
    /// use stream_relay::utils::url::UrlUtils;
    ///
    /// assert!(UrlUtils::is_http_url("https://cdn.example/seg1.ts"));
    /// assert!(!UrlUtils::is_http_url("seg1.ts"));
    /// assert!(!UrlUtils::is_http_url("skd://key-id"));
    /// ```
    pub fn is_http_url(candidate: &str) -> bool {
        Url::parse(candidate.trim())
            .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
            .unwrap_or(false)
    }

    /// Host (with port, when non-default) of a URL
    pub fn extract_host(url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        Some(match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    /// `scheme://host[:port]` of a URL
    pub fn origin_of(url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let origin = parsed.origin();
        origin.is_tuple().then(|| origin.ascii_serialization())
    }

    /// Referer/Origin pair for a bare host, as upstream CDNs expect them
    pub fn referer_headers_for_host(host: &str) -> (String, String) {
        let origin = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        (format!("{origin}/"), origin)
    }

    /// Resolve `reference` against `base`
    pub fn join(base: &str, reference: &str) -> Result<String, url::ParseError> {
        Url::parse(base)?.join(reference).map(|u| u.to_string())
    }

    /// Whether the URL path ends with the given extension (case-insensitive)
    pub fn path_has_extension(url: &str, extension: &str) -> bool {
        Url::parse(url)
            .map(|u| {
                u.path()
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", extension.to_ascii_lowercase()))
            })
            .unwrap_or(false)
    }

    /// Strip credentials and query string so the URL is safe to log
    ///
    /// ```rust
    /// use stream_relay::utils::url::UrlUtils;
    ///
    /// let redacted = UrlUtils::redact("https://u:p@cdn.example/live.m3u8?md5=abc&expires=1");
    /// assert_eq!(redacted, "https://cdn.example/live.m3u8?…");
    /// ```
    pub fn redact(url: &str) -> String {
        match Url::parse(url) {
            Ok(mut parsed) => {
                let had_query = parsed.query().is_some();
                let _ = parsed.set_username("");
                let _ = parsed.set_password(None);
                parsed.set_query(None);
                parsed.set_fragment(None);
                if had_query {
                    format!("{parsed}?…")
                } else {
                    parsed.to_string()
                }
            }
            Err(_) => "<invalid url>".to_string(),
        }
    }
}
