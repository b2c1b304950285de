//! Utility modules shared across the relay

pub mod http_client;
pub mod human_format;
pub mod jitter;
pub mod url;

pub use http_client::{HttpFetcher, HttpRequest, HttpResponse, ReqwestFetcher, RetryPolicy, StageFetcher};
pub use url::UrlUtils;
