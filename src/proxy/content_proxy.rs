//! Segment and key relay
//!
//! Each relayed request runs as its own governor session with a dedicated
//! upstream client that keeps no idle connections, so a slow or failing
//! upstream peer only ever ties up the session that talks to it. The
//! session ends when the body finishes, the client disconnects (the body
//! stream is dropped), the relay stalls past the segment timeout, or the
//! governor cancels it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, RANGE, REFERER};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::errors::{AppResult, ProxyError};
use crate::proxy::codec::{OpaqueUrlCodec, TokenPayload};
use crate::services::concurrency_governor::{ConcurrencyGovernor, SessionKind};
use crate::utils::url::UrlUtils;

const DEFAULT_CONTENT_TYPE: &str = "video/mp2t";

/// Upstream response being relayed to the client
pub struct RelayedContent {
    pub status: u16,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, io::Error>>,
}

impl std::fmt::Debug for RelayedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedContent")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ContentProxy {
    codec: Arc<OpaqueUrlCodec>,
    governor: ConcurrencyGovernor,
    user_agent: String,
    connect_timeout: Duration,
    segment_timeout: Duration,
    key_timeout: Duration,
}

impl ContentProxy {
    pub fn new(codec: Arc<OpaqueUrlCodec>, governor: ConcurrencyGovernor, config: &ProxyConfig) -> Self {
        Self {
            codec,
            governor,
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout,
            segment_timeout: config.segment_timeout,
            key_timeout: config.key_timeout,
        }
    }

    pub fn codec(&self) -> &OpaqueUrlCodec {
        &self.codec
    }

    /// Client owned by exactly one session
    fn session_client(&self) -> Result<Client, ProxyError> {
        Client::builder()
            .user_agent(&self.user_agent)
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ProxyError::Client {
                message: e.to_string(),
            })
    }

    fn upstream_headers(referer_host: Option<&str>, range: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(host) = referer_host.filter(|h| !h.is_empty()) {
            let (referer, origin) = UrlUtils::referer_headers_for_host(host);
            if let Ok(value) = HeaderValue::from_str(&referer) {
                headers.insert(REFERER, value);
            }
            if let Ok(value) = HeaderValue::from_str(&origin) {
                headers.insert(ORIGIN, value);
            }
        }
        if let Some(Ok(value)) = range.map(HeaderValue::from_str) {
            headers.insert(RANGE, value);
        }
        headers
    }

    /// Relay the content behind `token` as a byte stream
    pub async fn stream_content(&self, token: &str, range: Option<&str>) -> AppResult<RelayedContent> {
        let payload = self.codec.decode(token)?;
        let guard = self
            .governor
            .admit(SessionKind::Segment, payload.channel_id.as_deref())?;
        let client = self.session_client()?;
        let redacted = UrlUtils::redact(&payload.url);

        let request = client
            .get(&payload.url)
            .headers(Self::upstream_headers(payload.referer_host.as_deref(), range));
        let cancel = guard.cancellation();
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProxyError::Cancelled { session: guard.id() }.into());
            }
            sent = tokio::time::timeout(self.segment_timeout, request.send()) => match sent {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!("Segment request failed for {}: {}", redacted, e);
                    return Err(ProxyError::Upstream { url: redacted, message: e.to_string() }.into());
                }
                Err(_) => {
                    warn!("Segment request timed out for {}", redacted);
                    return Err(ProxyError::Timeout { url: redacted }.into());
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Upstream returned {} for {}", status, redacted);
            return Err(ProxyError::Status {
                url: redacted,
                status: status.as_u16(),
            }
            .into());
        }

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type =
            header(reqwest::header::CONTENT_TYPE).unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let content_range = header(reqwest::header::CONTENT_RANGE);
        let content_length = response.content_length();
        debug!(
            "Relaying {} ({}, {:?} bytes) in session {}",
            redacted,
            content_type,
            content_length,
            guard.id()
        );

        let stall_timeout = self.segment_timeout;
        let mut upstream = response.bytes_stream();
        let body = async_stream::stream! {
            // The session and its connection live exactly as long as the body
            let guard = guard;
            let _client = client;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Session {} cancelled while relaying {}", guard.id(), redacted);
                        break;
                    }
                    next = tokio::time::timeout(stall_timeout, upstream.next()) => next,
                };
                match next {
                    Ok(Some(Ok(chunk))) => {
                        guard.record_bytes(chunk.len() as u64);
                        yield Ok(chunk);
                    }
                    Ok(Some(Err(e))) => {
                        warn!("Upstream error while relaying {}: {}", redacted, e);
                        yield Err(io::Error::other(e));
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!("Upstream stalled for {:?} while relaying {}", stall_timeout, redacted);
                        yield Err(io::Error::new(io::ErrorKind::TimedOut, "upstream stalled"));
                        break;
                    }
                }
            }
        };

        Ok(RelayedContent {
            status: status.as_u16(),
            content_type,
            content_length,
            content_range,
            body: body.boxed(),
        })
    }

    /// Fetch an encryption key, reproducing the Referer the playlist had
    pub async fn fetch_key(&self, key_token: &str, referer_token: &str) -> AppResult<Bytes> {
        let key: TokenPayload = self.codec.decode(key_token)?;
        // The referer token carries the bare host in its url field
        let referer = self.codec.decode(referer_token)?;
        let referer_host = Some(referer.url)
            .filter(|host| !host.is_empty())
            .or(key.referer_host.clone());

        let guard = self
            .governor
            .admit(SessionKind::Key, key.channel_id.as_deref())?;
        let client = self.session_client()?;
        let redacted = UrlUtils::redact(&key.url);

        let fetch = async {
            let response = client
                .get(&key.url)
                .headers(Self::upstream_headers(referer_host.as_deref(), None))
                .send()
                .await
                .map_err(|e| ProxyError::Upstream {
                    url: redacted.clone(),
                    message: e.to_string(),
                })?;
            let status = response.status();
            if !status.is_success() {
                return Err(ProxyError::Status {
                    url: redacted.clone(),
                    status: status.as_u16(),
                });
            }
            response.bytes().await.map_err(|e| ProxyError::Upstream {
                url: redacted.clone(),
                message: e.to_string(),
            })
        };

        let cancel = guard.cancellation();
        let bytes = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProxyError::Cancelled { session: guard.id() }.into());
            }
            fetched = tokio::time::timeout(self.key_timeout, fetch) => {
                fetched.map_err(|_| ProxyError::Timeout {
                    url: redacted.clone(),
                })??
            }
        };
        debug!("Fetched {} byte key from {}", bytes.len(), redacted);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GovernorConfig;
    use crate::errors::{AdmissionError, AppError, TokenError};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn proxy(max_sessions: usize) -> (ContentProxy, ConcurrencyGovernor) {
        let codec = Arc::new(OpaqueUrlCodec::new(&[9u8; 32]).unwrap());
        let governor = ConcurrencyGovernor::new(&GovernorConfig {
            max_sessions,
            ..GovernorConfig::default()
        });
        let config = ProxyConfig {
            segment_timeout: Duration::from_secs(2),
            key_timeout: Duration::from_secs(2),
            ..ProxyConfig::default()
        };
        (ContentProxy::new(codec, governor.clone(), &config), governor)
    }

    async fn collect(content: RelayedContent) -> Vec<u8> {
        let chunks: Vec<Result<Bytes, io::Error>> = content.body.collect().await;
        chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect()
    }

    #[tokio::test]
    async fn relays_segment_with_referer_and_releases_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hls/seg1.ts"))
            .and(header("referer", "https://embed.example/"))
            .and(header("origin", "https://embed.example"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "video/mp2t")
                    .set_body_bytes(vec![7u8; 4096]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (proxy, governor) = proxy(2);
        let url = format!("{}/hls/seg1.ts", server.uri());
        let token = proxy.codec().encode(&url, Some("embed.example")).unwrap();

        let content = proxy.stream_content(&token, None).await.unwrap();
        assert_eq!(content.content_type, "video/mp2t");
        assert_eq!(governor.active_count(), 1);

        let body = collect(content).await;
        assert_eq!(body.len(), 4096);
        assert_eq!(governor.active_count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_body_ends_the_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
            .mount(&server)
            .await;

        let (proxy, governor) = proxy(1);
        let token = proxy.codec().encode(&format!("{}/a.ts", server.uri()), None).unwrap();
        let content = proxy.stream_content(&token, None).await.unwrap();

        let rejected = proxy.stream_content(&token, None).await.unwrap_err();
        assert!(matches!(
            rejected,
            AppError::Admission(AdmissionError::Rejected { active: 1, limit: 1 })
        ));

        drop(content);
        assert_eq!(governor.active_count(), 0);
        assert!(proxy.stream_content(&token, None).await.is_ok());
    }

    #[tokio::test]
    async fn upstream_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (proxy, governor) = proxy(2);
        let token = proxy.codec().encode(&format!("{}/gone.ts", server.uri()), None).unwrap();
        let err = proxy.stream_content(&token, None).await.unwrap_err();

        assert!(matches!(err, AppError::Proxy(ProxyError::Status { status: 404, .. })));
        assert_eq!(governor.active_count(), 0);
    }

    #[tokio::test]
    async fn tampered_token_is_rejected_before_admission() {
        let (proxy, governor) = proxy(2);
        let err = proxy.stream_content("AQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", None).await.unwrap_err();
        assert!(matches!(err, AppError::Token(TokenError::Authentication)));
        assert_eq!(governor.active_count(), 0);
    }

    #[tokio::test]
    async fn forwards_range_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-9"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-9/100")
                    .set_body_bytes(vec![0u8; 10]),
            )
            .mount(&server)
            .await;

        let (proxy, _) = proxy(2);
        let token = proxy.codec().encode(&format!("{}/clip.mp4", server.uri()), None).unwrap();
        let content = proxy.stream_content(&token, Some("bytes=0-9")).await.unwrap();
        assert_eq!(content.status, 206);
        assert_eq!(content.content_range.as_deref(), Some("bytes 0-9/100"));
    }

    #[tokio::test]
    async fn fetches_key_with_reproduced_referer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys/1"))
            .and(header("referer", "https://player.example/"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xAB; 16]))
            .expect(1)
            .mount(&server)
            .await;

        let (proxy, governor) = proxy(2);
        let key_token = proxy
            .codec()
            .encode(&format!("{}/keys/1", server.uri()), Some("player.example"))
            .unwrap();
        let referer_token = proxy.codec().encode("player.example", None).unwrap();

        let key = proxy.fetch_key(&key_token, &referer_token).await.unwrap();
        assert_eq!(key.as_ref(), &[0xAB; 16]);
        assert_eq!(governor.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_key_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 16])
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;

        let (proxy, governor) = proxy(2);
        let key_token = proxy
            .codec()
            .encode(&format!("{}/keys/slow", server.uri()), None)
            .unwrap();
        let referer_token = proxy.codec().encode("", None).unwrap();

        let (fetched, drained) = tokio::join!(proxy.fetch_key(&key_token, &referer_token), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            governor.shutdown(Duration::from_millis(500)).await
        });

        assert!(matches!(fetched, Err(AppError::Proxy(ProxyError::Cancelled { .. }))));
        assert!(drained);
    }
}
