//! Compiled regex sets for the embed-scrape strategy

use regex::Regex;

use crate::models::EmbedScrapeConfig;
use crate::utils::url::UrlUtils;

/// Static assets that match the loose `cdn`/`stream` patterns but are never streams
const ASSET_EXTENSIONS: &[&str] = &[
    "js", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2", "ttf",
];

#[derive(Debug, Clone)]
pub struct EmbedPatterns {
    embed: Regex,
    streams: Vec<Regex>,
    js_variables: Vec<Regex>,
    excluded_hosts: Vec<String>,
}

impl EmbedPatterns {
    pub fn compile(config: &EmbedScrapeConfig) -> Result<Self, regex::Error> {
        let embed = Regex::new(&config.embed_pattern)?;
        let streams = config
            .stream_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let js_variables = config
            .js_variables
            .iter()
            .map(|name| {
                Regex::new(&format!(
                    r#"\b{}\s*[:=]\s*["'](https?://[^"']+)["']"#,
                    regex::escape(name)
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            embed,
            streams,
            js_variables,
            excluded_hosts: config
                .excluded_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        })
    }

    /// First embed reference in the channel page. Relative references are
    /// resolved against `page_url`.
    pub fn find_embed(&self, html: &str, page_url: &str) -> Option<String> {
        let html = normalize(html);
        self.embed.captures_iter(&html).find_map(|captures| {
            let raw = captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().trim())?;
            if raw.is_empty() {
                return None;
            }
            if UrlUtils::is_http_url(raw) {
                Some(raw.to_string())
            } else {
                UrlUtils::join(page_url, raw).ok()
            }
        })
    }

    /// Direct stream URLs in pattern priority order, de-duplicated, with
    /// excluded hosts, static assets and the `skip` URLs removed
    pub fn find_streams(&self, html: &str, skip: &[&str]) -> Vec<String> {
        let html = normalize(html);
        let mut found: Vec<String> = Vec::new();

        for pattern in &self.streams {
            for m in pattern.find_iter(&html) {
                let candidate = m.as_str().trim_end_matches(['\\', ',', ';', ')']);
                if found.iter().any(|f| f == candidate)
                    || skip.contains(&candidate)
                    || !self.is_candidate(candidate)
                {
                    continue;
                }
                found.push(candidate.to_string());
            }
        }
        found
    }

    /// Stream URL assigned to one of the known JavaScript variables
    pub fn find_js_stream(&self, html: &str, skip: &[&str]) -> Option<String> {
        let html = normalize(html);
        self.js_variables.iter().find_map(|pattern| {
            pattern
                .captures_iter(&html)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .find(|url| !skip.contains(&url.as_str()) && self.is_candidate(url))
        })
    }

    fn is_candidate(&self, url: &str) -> bool {
        if !UrlUtils::is_http_url(url) {
            return false;
        }
        let host = UrlUtils::extract_host(url)
            .unwrap_or_default()
            .to_ascii_lowercase();
        if self
            .excluded_hosts
            .iter()
            .any(|excluded| host == *excluded || host.ends_with(&format!(".{excluded}")))
        {
            return false;
        }
        !ASSET_EXTENSIONS
            .iter()
            .any(|ext| UrlUtils::path_has_extension(url, ext))
    }
}

/// Undo the escaping pages commonly apply to URLs embedded in scripts and attributes
fn normalize(html: &str) -> String {
    html.replace("\\/", "/").replace("&amp;", "&")
}
