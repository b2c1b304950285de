//! Core services shared by every request

pub mod concurrency_governor;
pub mod stream_cache;
pub mod stream_service;

pub use concurrency_governor::{ConcurrencyGovernor, SessionGuard, SessionInfo, SessionKind};
pub use stream_cache::{CacheStats, StreamCache};
pub use stream_service::{HealthReport, PlaylistResponse, StreamService};
