//! Resolved stream descriptors

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::utils::url::UrlUtils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamKind {
    /// A playable media URL
    Direct,
    /// Only the embed page could be located; the client has to handle it
    ClientSideEmbed,
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub channel_id: String,
    pub url: String,
    pub kind: StreamKind,
    /// Full Referer upstream expects on playlist, segment and key requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Name of the service that produced this descriptor
    pub service: String,
    pub resolved_at: DateTime<Utc>,
    /// Expiry embedded by upstream in the stream URL, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StreamDescriptor {
    pub fn direct(
        channel_id: impl Into<String>,
        url: impl Into<String>,
        referer: Option<String>,
        service: impl Into<String>,
    ) -> Self {
        let url = url.into();
        let referer_host = referer.as_deref().and_then(UrlUtils::extract_host);
        let expires_at = parse_upstream_expiry(&url);
        Self {
            channel_id: channel_id.into(),
            url,
            kind: StreamKind::Direct,
            referer,
            referer_host,
            origin: None,
            service: service.into(),
            resolved_at: Utc::now(),
            expires_at,
        }
    }

    /// Degraded result carrying only the embed page reference
    pub fn client_side_embed(
        channel_id: impl Into<String>,
        embed_url: impl Into<String>,
        referer: Option<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            kind: StreamKind::ClientSideEmbed,
            expires_at: None,
            ..Self::direct(channel_id, embed_url, referer, service)
        }
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn is_client_side(&self) -> bool {
        self.kind == StreamKind::ClientSideEmbed
    }
}

/// Read the `expires` query parameter (unix seconds) that token-signed
/// upstream URLs carry.
pub fn parse_upstream_expiry(url: &str) -> Option<DateTime<Utc>> {
    let parsed = Url::parse(url).ok()?;
    let (_, value) = parsed.query_pairs().find(|(name, _)| name == "expires")?;
    let seconds: i64 = value.parse().ok()?;
    Utc.timestamp_opt(seconds, 0).single()
}
