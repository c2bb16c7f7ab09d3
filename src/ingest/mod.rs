// src/ingest/mod.rs
pub mod fetcher;
pub mod http;
pub mod parser;
pub mod types;

pub use fetcher::{FeedFetcher, FetchMode, FetcherConfig};
pub use types::{FeedTransport, FetchBatch, FetchOutcome, FetchStatus};

/// Max chars kept for a cleaned feed field.
pub const MAX_FIELD_CHARS: usize = 4000;

/// Clean feed markup: decode entities, strip tags, normalize quotes, collapse
/// whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)<[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    // Encoded markup inside CDATA may decode into more entities
    if out.contains('&') {
        out = html_escape::decode_html_entities(&out).to_string();
    }

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap
    if out.chars().count() > MAX_FIELD_CHARS {
        out = out.chars().take(MAX_FIELD_CHARS).collect();
    }

    out
}

/// Lowercased host of a URL, `""` when unparsable.
pub fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_ascii_lowercase()))
        .unwrap_or_default()
}
