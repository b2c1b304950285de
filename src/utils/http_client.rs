//! Upstream HTTP access for the extraction pipelines
//!
//! Pipelines never talk to reqwest directly; they go through the
//! [`HttpFetcher`] capability so resolution can be exercised without a
//! network. [`StageFetcher`] layers the per-stage budget and bounded retry
//! of transient failures on top.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::FetchError;
use crate::models::HttpMethod;
use crate::utils::jitter::backoff_ms;
use crate::utils::url::UrlUtils;

/// One upstream request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add `Referer` and, when given, `Origin`
    pub fn referer(self, referer: Option<&str>, origin: Option<&str>) -> Self {
        let request = match referer {
            Some(referer) => self.header("Referer", referer),
            None => self,
        };
        match origin {
            Some(origin) => request.header("Origin", origin),
            None => request,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Successful (2xx) upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// URL after redirects
    pub final_url: String,
    pub body: String,
}

/// Capability to perform upstream HTTP requests
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// Perform the request; non-2xx statuses are returned as [`FetchError::Status`]
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// Largest page, embed or playlist body buffered from upstream
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Pooled reqwest-backed fetcher shared by all extraction pipelines
pub struct ReqwestFetcher {
    client: Client,
    max_body_bytes: usize,
}

impl ReqwestFetcher {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    fn body_too_large(&self, url: &str) -> FetchError {
        FetchError::InvalidContent {
            url: url.to_string(),
            message: format!("body exceeds {} bytes", self.max_body_bytes),
        }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let url = request.url.clone();
        let timeout = request.timeout;
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.clone(),
                    timeout,
                }
            } else {
                FetchError::Network {
                    url: url.clone(),
                    message: e.to_string(),
                }
            }
        };

        let mut response = builder.timeout(timeout).send().await.map_err(map_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: request.url,
                status: status.as_u16(),
            });
        }
        let final_url = response.url().to_string();
        if response
            .content_length()
            .is_some_and(|length| length > self.max_body_bytes as u64)
        {
            warn!("Refusing oversized body from {}", UrlUtils::redact(&request.url));
            return Err(self.body_too_large(&request.url));
        }

        let mut buffer = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_err)? {
            if buffer.len() + chunk.len() > self.max_body_bytes {
                warn!("Upstream body from {} exceeded the size cap", UrlUtils::redact(&request.url));
                return Err(self.body_too_large(&request.url));
            }
            buffer.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&buffer).into_owned();

        Ok(HttpResponse {
            status: status.as_u16(),
            final_url,
            body,
        })
    }
}

/// Retry policy for transient stage failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            jitter_ms: 250,
        }
    }
}

/// Runs a request within a stage budget, retrying transient failures while
/// budget remains
#[derive(Clone)]
pub struct StageFetcher<'a> {
    fetcher: &'a dyn HttpFetcher,
    policy: RetryPolicy,
}

impl<'a> StageFetcher<'a> {
    pub fn new(fetcher: &'a dyn HttpFetcher, policy: RetryPolicy) -> Self {
        Self { fetcher, policy }
    }

    pub async fn fetch(
        &self,
        stage: &str,
        request: HttpRequest,
        budget: Duration,
    ) -> Result<HttpResponse, FetchError> {
        let deadline = Instant::now() + budget;
        let mut attempt = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FetchError::Timeout {
                    url: request.url.clone(),
                    timeout: budget,
                });
            }

            let attempt_request = request.clone().timeout(remaining);
            let outcome = match tokio::time::timeout(remaining, self.fetcher.fetch(attempt_request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Timeout {
                    url: request.url.clone(),
                    timeout: budget,
                }),
            };

            match outcome {
                Ok(response) => {
                    debug!(
                        "Stage '{}' fetched {} ({} bytes)",
                        stage,
                        UrlUtils::redact(&request.url),
                        response.body.len()
                    );
                    return Ok(response);
                }
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(backoff_ms(attempt, self.policy.jitter_ms));
                    if Instant::now() + delay >= deadline {
                        return Err(e);
                    }
                    warn!(
                        "Stage '{}' transient failure (attempt {}/{}): {}",
                        stage,
                        attempt,
                        self.policy.max_retries,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn network_error(url: &str) -> FetchError {
        FetchError::Network {
            url: url.to_string(),
            message: "connection reset".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let url = "https://a.example/page";
        let fetcher = ScriptedFetcher::new()
            .on(url, Scripted::Fail(network_error(url)))
            .body(url, "ok");
        let stage = StageFetcher::new(
            &fetcher,
            RetryPolicy {
                max_retries: 2,
                jitter_ms: 1,
            },
        );

        let response = stage
            .fetch("page", HttpRequest::get(url), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.body, "ok");
        assert_eq!(fetcher.count(url), 2);
    }

    #[tokio::test]
    async fn does_not_retry_http_status_errors() {
        let url = "https://a.example/missing";
        let fetcher = ScriptedFetcher::new();
        let stage = StageFetcher::new(&fetcher, RetryPolicy::default());

        let err = stage
            .fetch("page", HttpRequest::get(url), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(fetcher.count(url), 1);
    }

    #[tokio::test]
    async fn stops_retrying_after_max_retries() {
        let url = "https://a.example/flaky";
        let fetcher = ScriptedFetcher::new().on(url, Scripted::Fail(network_error(url)));
        let stage = StageFetcher::new(
            &fetcher,
            RetryPolicy {
                max_retries: 2,
                jitter_ms: 1,
            },
        );

        assert!(stage
            .fetch("page", HttpRequest::get(url), Duration::from_secs(5))
            .await
            .is_err());
        assert_eq!(fetcher.count(url), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upstream_times_out_within_budget() {
        let url = "https://a.example/slow";
        let fetcher = ScriptedFetcher::new().on(
            url,
            Scripted::Slow(Duration::from_secs(30), "late".to_string()),
        );
        let stage = StageFetcher::new(
            &fetcher,
            RetryPolicy {
                max_retries: 0,
                jitter_ms: 0,
            },
        );

        let err = stage
            .fetch("page", HttpRequest::get(url), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn oversized_bodies_are_refused() {
        use wiremock::matchers::path;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(path("/small"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;
        Mock::given(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;
        let fetcher = ReqwestFetcher::new("test-agent", Duration::from_secs(2))
            .unwrap()
            .with_max_body_bytes(1024);

        let small = fetcher
            .fetch(HttpRequest::get(format!("{}/small", server.uri())))
            .await
            .unwrap();
        assert_eq!(small.body, "<html>ok</html>");

        let err = fetcher
            .fetch(HttpRequest::get(format!("{}/huge", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidContent { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn referer_helper_adds_both_headers() {
        let request = HttpRequest::get("https://cdn.example/x")
            .referer(Some("https://embed.example/"), Some("https://embed.example"));
        assert_eq!(request.header_value("referer"), Some("https://embed.example/"));
        assert_eq!(request.header_value("Origin"), Some("https://embed.example"));
    }
}
