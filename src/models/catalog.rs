//! Channel catalog lookup
//!
//! The catalog itself is maintained elsewhere; the relay only needs to know
//! whether a channel id exists and which upstream identifiers it maps to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Identifiers the upstream aggregators know this channel by
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream_refs: Vec<String>,
}

impl Channel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            upstream_refs: Vec::new(),
        }
    }

    /// Identifier sent upstream; the first upstream reference, else the id
    pub fn upstream_id(&self) -> &str {
        self.upstream_refs
            .first()
            .map(String::as_str)
            .unwrap_or(&self.id)
    }
}

#[async_trait]
pub trait ChannelCatalog: Send + Sync {
    async fn lookup(&self, channel_id: &str) -> Option<Channel>;
}

/// Catalog backed by the `[[channels]]` configuration section
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    channels: HashMap<String, Channel>,
}

impl StaticCatalog {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: channels.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }
}

#[async_trait]
impl ChannelCatalog for StaticCatalog {
    async fn lookup(&self, channel_id: &str) -> Option<Channel> {
        self.channels.get(channel_id).cloned()
    }
}

/// Catalog that accepts any well-formed channel id
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCatalog;

#[async_trait]
impl ChannelCatalog for PassthroughCatalog {
    async fn lookup(&self, channel_id: &str) -> Option<Channel> {
        let valid = !channel_id.is_empty()
            && channel_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Channel::new(channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_catalog_only_knows_configured_channels() {
        let mut sports = Channel::new("sports");
        sports.upstream_refs.push("51".into());
        let catalog = StaticCatalog::new([sports]);

        let found = catalog.lookup("sports").await.unwrap();
        assert_eq!(found.upstream_id(), "51");
        assert!(catalog.lookup("news").await.is_none());
    }

    #[test]
    fn configured_channel_carries_name_and_refs() {
        let channel: Channel = toml::from_str(
            r#"
            id = "sports-1"
            name = "Sports One"
            upstream_refs = ["51", "52"]
            "#,
        )
        .unwrap();
        assert_eq!(channel.name.as_deref(), Some("Sports One"));
        assert_eq!(channel.upstream_id(), "51");
        assert_eq!(
            serde_json::to_value(Channel::new("7")).unwrap(),
            serde_json::json!({ "id": "7" })
        );
    }

    #[tokio::test]
    async fn passthrough_rejects_path_like_ids() {
        let catalog = PassthroughCatalog;
        assert_eq!(catalog.lookup("123").await.unwrap().upstream_id(), "123");
        assert!(catalog.lookup("").await.is_none());
        assert!(catalog.lookup("../etc").await.is_none());
    }
}
