//! HLS playlist rewriting
//!
//! Rewrites an upstream media or master playlist so that every URL a client
//! would fetch points back at this server as an opaque token:
//!
//! - `#EXT-X-KEY` lines with an absolute `URI="..."` become
//!   `/key/{key-token}/{referer-token}`
//! - absolute URL lines become `/content/{token}`, or `/playlist/{token}`
//!   for nested `.m3u8` playlists, when content proxying is on
//! - relative references are resolved against the playlist's own URL first,
//!   when that URL is known
//! - everything else is left byte-for-byte untouched
//!
//! Rewritten paths are relative to the server, so running the rewriter over
//! its own output changes nothing.

use std::sync::{Arc, LazyLock};

use regex::{NoExpand, Regex};
use tracing::{debug, warn};

use crate::errors::TokenError;
use crate::proxy::codec::{OpaqueUrlCodec, TokenPayload};
use crate::utils::url::UrlUtils;

pub const CONTENT_PATH: &str = "/content";
pub const KEY_PATH: &str = "/key";
pub const PLAYLIST_PATH: &str = "/playlist";

const KEY_TAG: &str = "#EXT-X-KEY:";

static KEY_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"URI="([^"]*)""#).unwrap_or_else(|e| panic!("invalid key URI regex: {e}"))
});

/// Whether the text looks like an HLS playlist
pub fn is_playlist(text: &str) -> bool {
    text.trim_start_matches('\u{feff}')
        .trim_start()
        .starts_with("#EXTM3U")
}

/// Where the playlist came from, carried into every token it produces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteContext {
    pub referer_host: Option<String>,
    pub channel_id: Option<String>,
    /// URL the playlist was fetched from, for resolving relative references
    pub base_url: Option<String>,
}

impl RewriteContext {
    pub fn new(referer_host: Option<String>, channel_id: Option<String>) -> Self {
        Self {
            referer_host,
            channel_id,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn absolutize(&self, reference: &str) -> Option<String> {
        let base = self.base_url.as_deref()?;
        UrlUtils::join(base, reference)
            .ok()
            .filter(|url| UrlUtils::is_http_url(url))
    }
}

#[derive(Debug, Clone)]
pub struct PlaylistRewriter {
    codec: Arc<OpaqueUrlCodec>,
    public_prefix: String,
    proxy_content: bool,
}

impl PlaylistRewriter {
    pub fn new(codec: Arc<OpaqueUrlCodec>, public_prefix: &str, proxy_content: bool) -> Self {
        Self {
            codec,
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
            proxy_content,
        }
    }

    pub fn proxy_content(&self) -> bool {
        self.proxy_content
    }

    pub fn codec(&self) -> &OpaqueUrlCodec {
        &self.codec
    }

    pub fn rewrite(&self, playlist: &str, context: &RewriteContext) -> Result<String, TokenError> {
        let mut keys = 0usize;
        let mut urls = 0usize;

        let lines = playlist
            .split('\n')
            .map(|raw| -> Result<String, TokenError> {
                // Keep a trailing CR out of the match but in the output
                let (line, cr) = match raw.strip_suffix('\r') {
                    Some(line) => (line, "\r"),
                    None => (raw, ""),
                };
                let trimmed = line.trim();

                if trimmed.starts_with(KEY_TAG) {
                    let rewritten = self.rewrite_key_line(line, context)?;
                    if rewritten != line {
                        keys += 1;
                    }
                    return Ok(format!("{rewritten}{cr}"));
                }

                if self.proxy_content && UrlUtils::is_http_url(trimmed) {
                    urls += 1;
                    return Ok(format!("{}{cr}", self.rewrite_url_line(trimmed, context)?));
                }

                if self.proxy_content && self.is_relative_reference(trimmed) {
                    if let Some(absolute) = context.absolutize(trimmed) {
                        urls += 1;
                        return Ok(format!("{}{cr}", self.rewrite_url_line(&absolute, context)?));
                    }
                }

                Ok(raw.to_string())
            })
            .collect::<Result<Vec<_>, TokenError>>()?;

        debug!(
            "Rewrote playlist: {} key line(s), {} URL line(s)",
            keys, urls
        );
        Ok(lines.join("\n"))
    }

    /// `{prefix}/content/{token}` for a single non-playlist resource
    pub fn content_location(&self, url: &str, context: &RewriteContext) -> Result<String, TokenError> {
        let payload = TokenPayload::new(url, context.referer_host.clone())
            .for_channel(context.channel_id.clone());
        let token = self.codec.encode_payload(&payload)?;
        Ok(format!("{}{}/{}", self.public_prefix, CONTENT_PATH, token))
    }

    /// A URI line that is neither a tag nor one of our own proxied paths
    fn is_relative_reference(&self, line: &str) -> bool {
        if line.is_empty() || line.starts_with('#') || line.contains("://") {
            return false;
        }
        !self.is_own_path(line)
    }

    /// One of our routes followed by exactly the tokens it takes, each
    /// issued under this codec's key. Upstream paths such as `/key/abc`
    /// fail the token check.
    fn is_own_path(&self, reference: &str) -> bool {
        let Some(rest) = reference.strip_prefix(self.public_prefix.as_str()) else {
            return false;
        };
        [(CONTENT_PATH, 1), (PLAYLIST_PATH, 1), (KEY_PATH, 2)]
            .iter()
            .any(|(path, token_count)| {
                rest.strip_prefix(path)
                    .and_then(|tokens| tokens.strip_prefix('/'))
                    .is_some_and(|tokens| {
                        let tokens: Vec<&str> = tokens.split('/').collect();
                        tokens.len() == *token_count
                            && tokens.iter().all(|token| self.codec.decode(token).is_ok())
                    })
            })
    }

    fn rewrite_url_line(&self, url: &str, context: &RewriteContext) -> Result<String, TokenError> {
        let payload = TokenPayload::new(url, context.referer_host.clone())
            .for_channel(context.channel_id.clone());
        let token = self.codec.encode_payload(&payload)?;
        let path = if UrlUtils::path_has_extension(url, "m3u8") {
            PLAYLIST_PATH
        } else {
            CONTENT_PATH
        };
        Ok(format!("{}{}/{}", self.public_prefix, path, token))
    }

    fn rewrite_key_line(&self, line: &str, context: &RewriteContext) -> Result<String, TokenError> {
        let Some(captures) = KEY_URI.captures(line) else {
            return Ok(line.to_string());
        };
        let resolved = match &captures[1] {
            uri if UrlUtils::is_http_url(uri) => Some(uri.to_string()),
            uri if self.is_relative_reference(uri) => context.absolutize(uri),
            _ => None,
        };
        let Some(key_url) = resolved.as_deref() else {
            // Already-rewritten key URIs stay as they are
            if !self.is_own_path(&captures[1]) {
                warn!("Leaving unresolvable key URI untouched");
            }
            return Ok(line.to_string());
        };

        let referer_host = context
            .referer_host
            .clone()
            .or_else(|| UrlUtils::extract_host(key_url))
            .unwrap_or_default();
        let key_token = self.codec.encode_payload(
            &TokenPayload::new(key_url, Some(referer_host.clone()))
                .for_channel(context.channel_id.clone()),
        )?;
        let referer_token = self.codec.encode(&referer_host, None)?;
        let replacement = format!(
            "URI=\"{}{}/{}/{}\"",
            self.public_prefix, KEY_PATH, key_token, referer_token
        );

        Ok(KEY_URI.replace(line, NoExpand(&replacement)).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter(proxy_content: bool) -> PlaylistRewriter {
        let codec = Arc::new(OpaqueUrlCodec::new(&[3u8; 32]).unwrap());
        PlaylistRewriter::new(codec, "", proxy_content)
    }

    fn token_after<'a>(line: &'a str, prefix: &str) -> &'a str {
        line.strip_prefix(prefix).unwrap()
    }

    #[test]
    fn rewrites_keys_and_segments() {
        let rewriter = rewriter(true);
        let input = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"https://u/key\"\n#EXTINF:6,\nhttps://u/seg1.ts\n";
        let context = RewriteContext::new(Some("h".into()), Some("7".into()));

        let output = rewriter.rewrite(input, &context).unwrap();
        let lines: Vec<&str> = output.split('\n').collect();

        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[2], "#EXTINF:6,");
        assert_eq!(lines[4], "");

        let key_line = lines[1];
        assert!(key_line.starts_with("#EXT-X-KEY:METHOD=AES-128,URI=\"/key/"));
        let tokens = key_line
            .trim_start_matches("#EXT-X-KEY:METHOD=AES-128,URI=\"/key/")
            .trim_end_matches('"');
        let (key_token, referer_token) = tokens.split_once('/').unwrap();
        let codec = rewriter.codec();
        assert_eq!(codec.decode(key_token).unwrap().url, "https://u/key");
        assert_eq!(codec.decode(referer_token).unwrap().url, "h");

        let segment = codec
            .decode(token_after(lines[3], "/content/"))
            .unwrap();
        assert_eq!(segment.url, "https://u/seg1.ts");
        assert_eq!(segment.referer_host.as_deref(), Some("h"));
        assert_eq!(segment.channel_id.as_deref(), Some("7"));
    }

    #[test]
    fn rewriting_is_idempotent() {
        let rewriter = rewriter(true);
        let input = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"https://u/key\"\n#EXTINF:6,\nhttps://u/seg1.ts\n";
        let context = RewriteContext::new(Some("h".into()), None);

        let once = rewriter.rewrite(input, &context).unwrap();
        let twice = rewriter.rewrite(&once, &context).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn leaves_segments_alone_when_proxying_is_off() {
        let rewriter = rewriter(false);
        let input = "#EXTM3U\n#EXTINF:6,\nhttps://u/seg1.ts\n";
        let output = rewriter.rewrite(input, &RewriteContext::default()).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn passes_through_relative_and_comment_lines() {
        let rewriter = rewriter(true);
        let input = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\n#EXTINF:6,\nseg1.ts\n#EXT-X-KEY:METHOD=NONE\n#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://abc\"";
        let output = rewriter.rewrite(input, &RewriteContext::default()).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn nested_playlists_route_to_playlist_path() {
        let rewriter = rewriter(true);
        let input = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nhttps://u/720p/index.m3u8?t=1\n";
        let output = rewriter.rewrite(input, &RewriteContext::default()).unwrap();
        let line = output.lines().nth(2).unwrap();
        let payload = rewriter
            .codec()
            .decode(token_after(line, "/playlist/"))
            .unwrap();
        assert_eq!(payload.url, "https://u/720p/index.m3u8?t=1");
    }

    #[test]
    fn preserves_crlf_line_endings() {
        let rewriter = rewriter(true);
        let input = "#EXTM3U\r\nhttps://u/seg1.ts\r\n";
        let output = rewriter.rewrite(input, &RewriteContext::default()).unwrap();
        assert!(output.starts_with("#EXTM3U\r\n/content/"));
        assert!(output.ends_with("\r\n"));
    }

    #[test]
    fn resolves_relative_references_against_playlist_url() {
        let rewriter = rewriter(true);
        let input = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"../keys/k1\"\n#EXTINF:6,\nseg1.ts\n";
        let context = RewriteContext::new(Some("h".into()), None)
            .with_base_url("https://u/hls/live/index.m3u8");

        let output = rewriter.rewrite(input, &context).unwrap();
        let lines: Vec<&str> = output.split('\n').collect();
        let segment = rewriter
            .codec()
            .decode(token_after(lines[3], "/content/"))
            .unwrap();
        assert_eq!(segment.url, "https://u/hls/live/seg1.ts");

        let key_token = lines[1]
            .trim_start_matches("#EXT-X-KEY:METHOD=AES-128,URI=\"/key/")
            .split('/')
            .next()
            .unwrap();
        assert_eq!(
            rewriter.codec().decode(key_token).unwrap().url,
            "https://u/hls/keys/k1"
        );

        // Output paths are ours and are not resolved again
        assert_eq!(rewriter.rewrite(&output, &context).unwrap(), output);
    }

    #[test]
    fn upstream_paths_shaped_like_routes_are_resolved() {
        let rewriter = rewriter(true);
        let input = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"/key/abc\"\n#EXTINF:6,\n/content/seg1.ts\n";
        let context = RewriteContext::new(Some("h".into()), None)
            .with_base_url("https://u/hls/index.m3u8");

        let output = rewriter.rewrite(input, &context).unwrap();
        let lines: Vec<&str> = output.split('\n').collect();

        let key_token = lines[1]
            .trim_start_matches("#EXT-X-KEY:METHOD=AES-128,URI=\"/key/")
            .split('/')
            .next()
            .unwrap();
        assert_eq!(
            rewriter.codec().decode(key_token).unwrap().url,
            "https://u/key/abc"
        );
        let segment = rewriter
            .codec()
            .decode(token_after(lines[3], "/content/"))
            .unwrap();
        assert_eq!(segment.url, "https://u/content/seg1.ts");
    }

    #[test]
    fn foreign_tokens_are_not_treated_as_local() {
        let ours = rewriter(true);
        let other = PlaylistRewriter::new(Arc::new(OpaqueUrlCodec::new(&[4u8; 32]).unwrap()), "", true);
        let context = RewriteContext::default().with_base_url("https://u/hls/index.m3u8");

        let foreign = other.rewrite("https://cdn/seg1.ts", &context).unwrap();
        let output = ours.rewrite(&foreign, &context).unwrap();
        let payload = ours.codec().decode(token_after(&output, "/content/")).unwrap();
        assert_eq!(payload.url, format!("https://u{foreign}"));
    }

    #[test]
    fn applies_public_prefix() {
        let codec = Arc::new(OpaqueUrlCodec::new(&[3u8; 32]).unwrap());
        let rewriter = PlaylistRewriter::new(codec, "/relay/", true);
        let output = rewriter
            .rewrite("https://u/seg1.ts", &RewriteContext::default())
            .unwrap();
        assert!(output.starts_with("/relay/content/"));
    }

    #[test]
    fn detects_playlists() {
        assert!(is_playlist("#EXTM3U\n#EXTINF:6,\nseg.ts"));
        assert!(is_playlist("\u{feff}#EXTM3U\n"));
        assert!(!is_playlist("<html>"));
    }
}
