// src/ingest/parser.rs
//! RSS 2.0 / RSS 1.0 (RDF) / Atom parsing into `FetchedArticle`s.
//!
//! Feeds in the wild are rarely well-formed, so this walks the event stream
//! instead of deserializing into fixed structs: end-name checks are off, unknown
//! HTML entities fall back to the raw text (cleaned later by `normalize_text`),
//! and nested markup inside a field is flattened into text.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::ingest::normalize_text;
use crate::types::{FetchedArticle, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Summary,
    Content,
    Date,
    Guid,
}

#[derive(Debug, Default)]
struct ItemBuilder {
    title: String,
    link: String,
    summary: String,
    content: String,
    date: String,
    guid: String,
    image: Option<String>,
}

impl ItemBuilder {
    fn set(&mut self, field: Field, value: String) {
        let value = value.trim().to_string();
        if value.is_empty() {
            return;
        }
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Summary => &mut self.summary,
            Field::Content => &mut self.content,
            Field::Date => &mut self.date,
            Field::Guid => &mut self.guid,
        };
        // First occurrence wins (published before updated, alternate link first)
        if slot.is_empty() {
            *slot = value;
        }
    }

    fn build(self, source: &Source) -> Option<FetchedArticle> {
        let title = normalize_text(&self.title);
        let link = if !self.link.trim().is_empty() {
            self.link.trim().to_string()
        } else if self.guid.starts_with("http") {
            self.guid.trim().to_string()
        } else {
            String::new()
        };
        if link.is_empty() || (title.is_empty() && self.summary.is_empty()) {
            return None;
        }
        let summary = normalize_text(&self.summary);
        let content = Some(normalize_text(&self.content)).filter(|c| !c.is_empty() && *c != summary);
        Some(FetchedArticle {
            title,
            summary,
            content,
            link,
            published_at: parse_date(&self.date),
            source_id: source.id,
            source_name: source.name.clone(),
            country: source.country.clone(),
            image_url: self.image,
        })
    }
}

fn field_for(name: &[u8]) -> Option<Field> {
    match name {
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"description" | b"summary" | b"subtitle" => Some(Field::Summary),
        b"content" | b"encoded" => Some(Field::Content),
        b"pubDate" | b"published" | b"updated" | b"date" | b"issued" => Some(Field::Date),
        b"guid" | b"id" => Some(Field::Guid),
        _ => None,
    }
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn is_image_type(t: Option<&str>) -> bool {
    t.map(|t| t.starts_with("image/")).unwrap_or(false)
}

/// Attribute-carried data: Atom links and image enclosures.
fn absorb_attributes(item: &mut ItemBuilder, e: &BytesStart<'_>) {
    let name = e.local_name();
    match name.as_ref() {
        b"link" => {
            let Some(href) = attr(e, b"href") else {
                return;
            };
            let rel = attr(e, b"rel");
            match rel.as_deref() {
                None | Some("alternate") => item.set(Field::Link, href),
                Some("enclosure") if is_image_type(attr(e, b"type").as_deref()) => {
                    item.image.get_or_insert(href);
                }
                _ => {}
            }
        }
        b"enclosure" => {
            if is_image_type(attr(e, b"type").as_deref()) {
                if let Some(url) = attr(e, b"url") {
                    item.image.get_or_insert(url);
                }
            }
        }
        b"content" | b"thumbnail" => {
            // media:content / media:thumbnail
            let medium_ok = match attr(e, b"medium") {
                Some(m) => m == "image",
                None => attr(e, b"type").map_or(true, |t| t.starts_with("image/")),
            };
            if medium_ok {
                if let Some(url) = attr(e, b"url") {
                    item.image.get_or_insert(url);
                }
            }
        }
        _ => {}
    }
}

/// Parse a feed document. Fails only when the payload is not a feed at all.
pub fn parse_feed(xml: &str, source: &Source) -> Result<Vec<FetchedArticle>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut out = Vec::new();
    let mut saw_root = false;
    let mut depth = 0usize;
    let mut item: Option<(ItemBuilder, usize)> = None;
    let mut capture: Option<(Field, usize)> = None;
    let mut buf = String::new();

    loop {
        let ev = reader
            .read_event()
            .map_err(|e| anyhow!("xml error at {}: {e}", reader.buffer_position()))?;
        match ev {
            Event::Start(e) => {
                depth += 1;
                let name = e.local_name();
                let name = name.as_ref();
                if matches!(name, b"rss" | b"feed" | b"RDF") {
                    saw_root = true;
                }
                if matches!(name, b"item" | b"entry") && item.is_none() {
                    item = Some((ItemBuilder::default(), depth));
                    continue;
                }
                if let Some((it, _)) = item.as_mut() {
                    absorb_attributes(it, &e);
                    if capture.is_none() {
                        if let Some(f) = field_for(name) {
                            capture = Some((f, depth));
                            buf.clear();
                        }
                    }
                }
            }
            Event::Empty(e) => {
                if let Some((it, _)) = item.as_mut() {
                    absorb_attributes(it, &e);
                }
            }
            Event::Text(t) => {
                if capture.is_some() {
                    let s = t
                        .unescape()
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                    push_text(&mut buf, &s);
                }
            }
            Event::CData(c) => {
                if capture.is_some() {
                    push_text(&mut buf, &String::from_utf8_lossy(&c));
                }
            }
            Event::End(_) => {
                if let Some((field, d)) = capture {
                    if d == depth {
                        if let Some((it, _)) = item.as_mut() {
                            it.set(field, std::mem::take(&mut buf));
                        }
                        capture = None;
                    }
                }
                if let Some((_, d)) = item.as_ref() {
                    if *d == depth {
                        if let Some((it, _)) = item.take() {
                            if let Some(article) = it.build(source) {
                                out.push(article);
                            }
                        }
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(anyhow!("document is not an RSS/Atom feed"));
    }
    Ok(out)
}

fn push_text(buf: &mut String, s: &str) {
    if !buf.is_empty() {
        buf.push(' ');
    }
    buf.push_str(s);
}

/// RFC 2822 (RSS) or RFC 3339 (Atom) timestamps.
pub fn parse_date(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if ts.is_empty() {
        return None;
    }
    if let Some(unix) = OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
    {
        return DateTime::<Utc>::from_timestamp(unix, 0);
    }
    DateTime::parse_from_rfc3339(ts)
        .or_else(|_| DateTime::parse_from_rfc2822(ts))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> Source {
        Source {
            id: 7,
            url: "https://feeds.example.test/rss".into(),
            name: "Example".into(),
            country: "EG".into(),
            enabled: true,
            consecutive_failures: 0,
        }
    }

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/" xmlns:content="http://purl.org/rss/1.0/modules/content/">
<channel>
  <title>Example</title>
  <link>https://example.test</link>
  <item>
    <title>Egypt announces new policy</title>
    <link>https://example.test/a</link>
    <description><![CDATA[<p>Cairo&nbsp;said on Monday</p>]]></description>
    <content:encoded><![CDATA[<p>Full text of the announcement.</p>]]></content:encoded>
    <pubDate>Mon, 06 Jan 2025 10:00:00 +0000</pubDate>
    <media:content url="https://example.test/a.jpg" medium="image"/>
  </item>
  <item>
    <title>No link here</title>
  </item>
</channel>
</rss>"#;

    #[test]
    fn parses_rss_items() {
        let items = parse_feed(RSS, &src()).unwrap();
        assert_eq!(items.len(), 1);
        let a = &items[0];
        assert_eq!(a.title, "Egypt announces new policy");
        assert_eq!(a.link, "https://example.test/a");
        assert_eq!(a.summary, "Cairo said on Monday");
        assert_eq!(a.content.as_deref(), Some("Full text of the announcement."));
        assert_eq!(a.image_url.as_deref(), Some("https://example.test/a.jpg"));
        assert_eq!(a.source_id, 7);
        assert_eq!(a.country, "EG");
        assert_eq!(a.published_at.unwrap().timestamp(), 1_736_157_600);
    }

    #[test]
    fn parses_atom_entries() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom</title>
  <entry>
    <title type="html">L'Égypte annonce</title>
    <link rel="alternate" href="https://example.test/fr/1"/>
    <link rel="enclosure" type="image/png" href="https://example.test/1.png"/>
    <updated>2025-01-06T10:00:00Z</updated>
    <summary>Le Caire a annoncé</summary>
  </entry>
</feed>"#;
        let items = parse_feed(atom, &src()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, "https://example.test/fr/1");
        assert_eq!(items[0].title, "L'Égypte annonce");
        assert_eq!(items[0].image_url.as_deref(), Some("https://example.test/1.png"));
        assert!(items[0].published_at.is_some());
    }

    #[test]
    fn rejects_non_feed() {
        assert!(parse_feed("<html><body>nope</body></html>", &src()).is_err());
    }

    #[test]
    fn empty_channel_is_ok() {
        let xml = r#"<rss><channel><title>x</title></channel></rss>"#;
        assert!(parse_feed(xml, &src()).unwrap().is_empty());
    }

    #[test]
    fn parse_date_formats() {
        assert!(parse_date("Tue, 07 Jan 2025 08:30:00 GMT").is_some());
        assert!(parse_date("2025-01-07T08:30:00+02:00").is_some());
        assert!(parse_date("yesterday").is_none());
        assert!(parse_date("").is_none());
    }
}
