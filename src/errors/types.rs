//! Error type definitions for the stream relay
//!
//! Errors are layered the same way the request flows: stage fetches produce
//! [`FetchError`], a service pipeline turns those into [`ExtractionError`],
//! the registry folds every attempt into a [`ResolveError`], and the web layer
//! only ever sees [`AppError`].

use std::time::Duration;

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Channel resolution failed
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    /// An opaque token could not be decoded
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// The concurrency governor refused a new session
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Relaying content from upstream failed
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure of a single upstream HTTP exchange inside an extraction stage
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Request timed out after {timeout:?}: {url}")]
    Timeout { url: String, timeout: Duration },

    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("Upstream returned HTTP {status}: {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid content from {url}: {message}")]
    InvalidContent { url: String, message: String },
}

impl FetchError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout { .. } | FetchError::Network { .. })
    }
}

/// Errors raised by the browser automation capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    /// No browser capability is configured or it cannot be reached
    #[error("Browser automation unavailable: {message}")]
    Unavailable { message: String },

    #[error("Browser wait condition not met within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("WebDriver protocol error: {message}")]
    Protocol { message: String },

    #[error("Script evaluation failed: {message}")]
    Script { message: String },
}

/// Failure of one service's extraction pipeline
#[derive(Error, Debug, Clone)]
pub enum ExtractionError {
    #[error("{0}")]
    Fetch(#[from] FetchError),

    /// A stage completed its fetch but the expected pattern was absent
    #[error("No match in stage '{stage}'")]
    PatternNotFound { stage: String },

    #[error("{0}")]
    Browser(#[from] BrowserError),

    #[error("Invalid upstream response: {message}")]
    InvalidResponse { message: String },

    /// The service's whole-attempt budget elapsed
    #[error("Service '{service}' timed out after {timeout:?}")]
    ServiceTimeout { service: String, timeout: Duration },
}

/// Terminal outcome of resolving a channel.
///
/// Cloneable so that every caller coalesced onto one in-flight resolution
/// observes the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Unknown channel: {channel_id}")]
    UnknownChannel { channel_id: String },

    #[error("Unknown service: {name}")]
    UnknownService { name: String },

    #[error("No streaming services are enabled")]
    NoServicesEnabled,

    #[error("All {attempts} services failed for channel {channel_id}: {last_error}")]
    AllServicesExhausted {
        channel_id: String,
        attempts: usize,
        last_error: String,
    },

    #[error("Resolution of channel {channel_id} exceeded {deadline:?}")]
    DeadlineExceeded { channel_id: String, deadline: Duration },

    /// The coalesced resolution was abandoned before producing a result
    #[error("Resolution of channel {channel_id} was abandoned")]
    Abandoned { channel_id: String },
}

/// Opaque token decoding failures. All variants are reported to clients as
/// a generic invalid token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token is not valid base64url")]
    Malformed,

    #[error("Token is too short")]
    Truncated,

    #[error("Unsupported token version: {0}")]
    UnsupportedVersion(u8),

    #[error("Token failed authentication")]
    Authentication,

    #[error("Token payload could not be decoded")]
    Payload,

    #[error("Token key is invalid: {message}")]
    InvalidKey { message: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Session limit reached: {active}/{limit} active")]
    Rejected { active: usize, limit: usize },

    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Errors while relaying a segment, key or nested playlist
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to build upstream client: {message}")]
    Client { message: String },

    #[error("Upstream request failed for {url}: {message}")]
    Upstream { url: String, message: String },

    #[error("Upstream returned HTTP {status}: {url}")]
    Status { url: String, status: u16 },

    #[error("Upstream timed out: {url}")]
    Timeout { url: String },

    /// The governor cancelled the session (idle or shutdown)
    #[error("Session {session} was cancelled")]
    Cancelled { session: uuid::Uuid },
}

/// Convenience methods for creating common error types
impl AppError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }
}

impl ExtractionError {
    pub fn pattern_not_found<S: Into<String>>(stage: S) -> Self {
        Self::PatternNotFound {
            stage: stage.into(),
        }
    }

    pub fn invalid_response<S: Into<String>>(message: S) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_timeouts_and_network_failures() {
        let timeout = FetchError::Timeout {
            url: "https://a/x".into(),
            timeout: Duration::from_secs(1),
        };
        let status = FetchError::Status {
            url: "https://a/x".into(),
            status: 500,
        };
        assert!(timeout.is_transient());
        assert!(!status.is_transient());
    }

    #[test]
    fn resolve_error_converts_into_app_error() {
        let err: AppError = ResolveError::NoServicesEnabled.into();
        assert!(matches!(err, AppError::Resolve(ResolveError::NoServicesEnabled)));
    }
}
