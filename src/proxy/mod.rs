//! Proxy layer: opaque tokens, playlist rewriting and content relay

pub mod codec;
pub mod content_proxy;
pub mod playlist_rewriter;

pub use codec::{OpaqueUrlCodec, TokenPayload};
pub use content_proxy::{ContentProxy, RelayedContent};
pub use playlist_rewriter::{PlaylistRewriter, RewriteContext, is_playlist};
