//! HTTP-level tests against the real router with a fake upstream

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{header as header_matcher, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stream_relay::{
    config::Config,
    errors::FetchError,
    models::{Channel, ServiceDescriptor},
    proxy::OpaqueUrlCodec,
    services::{SessionKind, StreamService},
    utils::http_client::{HttpFetcher, HttpRequest, HttpResponse},
    web::{AppState, create_router},
};

const TOKEN_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
const PAGE: &str = "https://site.example/stream/stream-7.php";
const EMBED: &str = "https://embed.example/stream/0f1e2d3c";
const STREAM: &str = "https://edge.example/hls/live.m3u8";

/// Upstream served from an in-memory URL table
#[derive(Default)]
struct FakeUpstream {
    pages: HashMap<String, String>,
}

impl FakeUpstream {
    fn channel_seven() -> Self {
        let mut pages = HashMap::new();
        pages.insert(
            PAGE.to_string(),
            format!(r#"<html><iframe src="{EMBED}"></iframe></html>"#),
        );
        pages.insert(
            EMBED.to_string(),
            format!(r#"<script>var src = "{STREAM}";</script>"#),
        );
        pages.insert(
            STREAM.to_string(),
            "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6,\nseg1.ts\n".to_string(),
        );
        Self { pages }
    }
}

#[async_trait]
impl HttpFetcher for FakeUpstream {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        match self.pages.get(&request.url) {
            Some(body) => Ok(HttpResponse {
                status: 200,
                final_url: request.url,
                body: body.clone(),
            }),
            None => Err(FetchError::Status {
                url: request.url,
                status: 404,
            }),
        }
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.proxy.token_key = Some(TOKEN_KEY.to_string());
    config.resolution.max_retries = 0;
    config.services = vec![ServiceDescriptor {
        name: "primary".to_string(),
        base_url: "https://site.example".to_string(),
        ..ServiceDescriptor::example()
    }];
    config
}

fn build(config: &Config, upstream: FakeUpstream) -> (Router, Arc<StreamService>) {
    let service = Arc::new(StreamService::from_config(config, Arc::new(upstream), None).unwrap());
    (create_router(AppState::new(service.clone())), service)
}

async fn send_request(app: &Router, method: Method, uri: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn codec() -> OpaqueUrlCodec {
    OpaqueUrlCodec::from_hex_key(TOKEN_KEY).unwrap()
}

#[tokio::test]
async fn stream_endpoint_serves_rewritten_playlist() {
    let (app, _) = build(&test_config(), FakeUpstream::channel_seven());

    let response = send_request(&app, Method::GET, "/stream/7.m3u8").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/vnd.apple.mpegurl"
    );

    let body = String::from_utf8(body_bytes(response).await).unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines[0], "#EXTM3U");
    let token = lines[3].strip_prefix("/content/").unwrap();
    let payload = codec().decode(token).unwrap();
    assert_eq!(payload.url, "https://edge.example/hls/seg1.ts");
    assert_eq!(payload.referer_host.as_deref(), Some("embed.example"));
}

#[tokio::test]
async fn stream_endpoint_redirects_when_proxying_is_off() {
    let mut config = test_config();
    config.proxy.proxy_content = false;
    let (app, _) = build(&config, FakeUpstream::channel_seven());

    let response = send_request(&app, Method::GET, "/stream/7.m3u8").await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers().get(header::LOCATION).unwrap(), STREAM);
}

#[tokio::test]
async fn unknown_channel_is_not_found() {
    let mut config = test_config();
    config.channels = vec![Channel::new("7")];
    let (app, _) = build(&config, FakeUpstream::channel_seven());

    let response = send_request(&app, Method::GET, "/stream/99.m3u8").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn exhausted_services_report_stream_unavailable() {
    let (app, _) = build(&test_config(), FakeUpstream::default());

    let response = send_request(&app, Method::GET, "/stream/7.m3u8").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "stream unavailable");
}

#[tokio::test]
async fn session_cap_rejects_with_retry_after() {
    let mut config = test_config();
    config.governor.max_sessions = 1;
    let (app, service) = build(&config, FakeUpstream::channel_seven());
    let _held = service.governor().admit(SessionKind::Segment, None).unwrap();

    let response = send_request(&app, Method::GET, "/stream/7.m3u8").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn tampered_content_token_is_forbidden() {
    let (app, _) = build(&test_config(), FakeUpstream::channel_seven());
    let mut token = codec().encode("https://edge.example/seg.ts", None).unwrap();
    let flipped = if token.ends_with('A') { 'B' } else { 'A' };
    token.pop();
    token.push(flipped);

    let response = send_request(&app, Method::GET, &format!("/content/{token}")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn resolve_endpoint_returns_descriptor() {
    let (app, _) = build(&test_config(), FakeUpstream::channel_seven());

    let response = send_request(&app, Method::GET, "/api/v1/resolve/7").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["url"], STREAM);
    assert_eq!(json["data"]["kind"], "direct");
    assert_eq!(json["data"]["service"], "primary");
}

#[tokio::test]
async fn services_can_be_toggled_at_runtime() {
    let (app, _) = build(&test_config(), FakeUpstream::channel_seven());

    let response = send_request(&app, Method::POST, "/api/v1/services/primary/disable").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["enabled"], false);

    let response = send_request(&app, Method::GET, "/api/v1/resolve/7").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = send_request(&app, Method::POST, "/api/v1/services/primary/enable").await;
    assert_eq!(body_json(response).await["data"]["enabled"], true);

    let response = send_request(&app, Method::POST, "/api/v1/services/missing/enable").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cache_administration_and_health() {
    let (app, _) = build(&test_config(), FakeUpstream::channel_seven());
    send_request(&app, Method::GET, "/api/v1/resolve/7").await;

    let health = body_json(send_request(&app, Method::GET, "/health").await).await;
    assert_eq!(health["data"]["cache"]["entries"], 1);
    assert_eq!(health["data"]["active_sessions"], 0);
    assert_eq!(health["data"]["services"][0]["name"], "primary");

    let response = send_request(&app, Method::DELETE, "/api/v1/cache/7").await;
    assert_eq!(body_json(response).await["data"]["removed"], 1);
    let response = send_request(&app, Method::DELETE, "/api/v1/cache").await;
    assert_eq!(body_json(response).await["data"]["removed"], 0);

    let sessions = body_json(send_request(&app, Method::GET, "/api/v1/sessions").await).await;
    assert_eq!(sessions["data"], serde_json::json!([]));

    let live = send_request(&app, Method::GET, "/live").await;
    assert_eq!(body_json(live).await["data"]["status"], "alive");
}

#[tokio::test]
async fn content_is_relayed_with_reproduced_referer() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hls/seg1.ts"))
        .and(header_matcher("referer", "https://embed.example/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "video/mp2t")
                .set_body_bytes(vec![0x47u8; 376]),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let (app, service) = build(&test_config(), FakeUpstream::channel_seven());
    let token = codec()
        .encode(&format!("{}/hls/seg1.ts", upstream.uri()), Some("embed.example"))
        .unwrap();

    let response = send_request(&app, Method::GET, &format!("/content/{token}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "video/mp2t"
    );
    let body = body_bytes(response).await;
    assert_eq!(body.len(), 376);
    assert_eq!(service.governor().active_count(), 0);
}

#[tokio::test]
async fn unsupported_range_is_rejected() {
    let (app, service) = build(&test_config(), FakeUpstream::channel_seven());
    let token = codec().encode("https://edge.example/seg.ts", None).unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/content/{token}"))
                .header(header::RANGE, "items=0-10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(service.governor().active_count(), 0);
}

#[tokio::test]
async fn resolve_can_target_one_service() {
    let (app, _) = build(&test_config(), FakeUpstream::channel_seven());

    let response = send_request(&app, Method::GET, "/api/v1/resolve/7?service=primary").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["url"], STREAM);

    let health = body_json(send_request(&app, Method::GET, "/health").await).await;
    assert_eq!(health["data"]["cache"]["entries"], 0);
    assert_eq!(health["data"]["services"][0]["successes"], 1);

    let response = send_request(&app, Method::GET, "/api/v1/resolve/7?service=missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "service 'missing' not found");
}
