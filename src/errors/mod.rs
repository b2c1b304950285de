//! Centralized error handling for the stream relay
//!
//! # Error Categories
//!
//! - **Fetch / Extraction Errors**: per-stage upstream failures that drive failover
//! - **Resolve Errors**: terminal outcomes of resolving a channel
//! - **Token Errors**: opaque token decoding failures
//! - **Admission Errors**: session limit and shutdown rejections
//! - **Proxy Errors**: failures while relaying upstream content
//!
//! # Usage
//!
//! ```rust
//! use stream_relay::errors::{AppError, AppResult};
//!
//! async fn example_function() -> AppResult<String> {
//!     Ok("success".to_string())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for extraction pipeline Results
pub type ExtractionResult<T> = Result<T, ExtractionError>;

/// Convenience type alias for resolution Results
pub type ResolveResult<T> = Result<T, ResolveError>;
