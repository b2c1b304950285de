pub mod catalog;
pub mod service;
pub mod stream;

pub use catalog::{Channel, ChannelCatalog, PassthroughCatalog, StaticCatalog};
pub use service::{
    EmbedScrapeConfig, HttpMethod, LegacyAuthConfig, ServiceDescriptor, StageTimeouts,
    StrategyConfig, fill_template,
};
pub use stream::{StreamDescriptor, StreamKind, parse_upstream_expiry};
