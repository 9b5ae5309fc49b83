//! Channel catalog in extended-playlist (`#EXTINF`) form.
//!
//! The catalog is read wholesale on every lookup; nothing is cached between
//! requests.

mod error;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

pub use error::{CatalogError, CatalogResult};

pub const EXTINF_MARKER: &str = "#EXTINF";
pub const UNNAMED_CHANNEL: &str = "Unnamed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRecord {
    pub name: String,
    pub logo: String,
    /// Numeric token taken from the source URL. Empty when the URL carries none.
    pub id: String,
    pub url: String,
}

struct Patterns {
    name: Regex,
    logo: Regex,
    id: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        name: Regex::new(r#"tvg-name="([^"]+)""#).expect("valid regex"),
        logo: Regex::new(r#"tvg-logo="([^"]+)""#).expect("valid regex"),
        id: Regex::new(r"/(\d+)\.ts$").expect("valid regex"),
    })
}

/// Parses catalog text into channel records, preserving input order.
///
/// An info line without a following source line is dropped. Missing
/// attributes fall back to defaults and never stop the scan.
pub fn parse_catalog(text: &str) -> Vec<ChannelRecord> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let mut records = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let info = lines[index];
        index += 1;
        if !info.starts_with(EXTINF_MARKER) {
            continue;
        }

        while index < lines.len() && lines[index].is_empty() {
            index += 1;
        }
        let Some(source) = lines.get(index).copied() else {
            debug!(line = info, "catalog entry without source line skipped");
            break;
        };
        if source.starts_with(EXTINF_MARKER) {
            debug!(line = info, "catalog entry truncated by next info line");
            continue;
        }
        index += 1;

        records.push(parse_entry(info, source));
    }

    records
}

fn parse_entry(info: &str, source: &str) -> ChannelRecord {
    let patterns = patterns();
    let capture = |regex: &Regex, haystack: &str| {
        regex
            .captures(haystack)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    };
    ChannelRecord {
        name: capture(&patterns.name, info).unwrap_or_else(|| UNNAMED_CHANNEL.to_string()),
        logo: capture(&patterns.logo, info).unwrap_or_default(),
        id: channel_id_from_url(source).unwrap_or_default(),
        url: source.to_string(),
    }
}

/// Extracts the trailing `/<digits>.ts` token of a source URL.
pub fn channel_id_from_url(url: &str) -> Option<String> {
    patterns()
        .id
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Writes records back out as catalog text that [`parse_catalog`] accepts.
pub fn render_catalog(records: &[ChannelRecord]) -> String {
    let mut out = String::from("#EXTM3U\n");
    for record in records {
        let _ = write!(out, "{EXTINF_MARKER}:-1");
        if !record.name.is_empty() {
            let _ = write!(out, " tvg-name=\"{}\"", record.name);
        }
        if !record.logo.is_empty() {
            let _ = write!(out, " tvg-logo=\"{}\"", record.logo);
        }
        let _ = writeln!(out, ",{}", record.name);
        let _ = writeln!(out, "{}", record.url);
    }
    out
}

#[derive(Debug, Clone)]
pub struct CatalogSource {
    path: PathBuf,
}

impl CatalogSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> CatalogResult<Vec<ChannelRecord>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CatalogError::Unavailable {
                path: self.path.clone(),
                source,
            })?;
        Ok(parse_catalog(&text))
    }

    /// First record carrying `channel_id` wins; empty ids never match.
    pub async fn resolve(&self, channel_id: &str) -> CatalogResult<Option<ChannelRecord>> {
        if channel_id.is_empty() {
            return Ok(None);
        }
        let records = self.load().await?;
        Ok(records.into_iter().find(|record| record.id == channel_id))
    }
}
