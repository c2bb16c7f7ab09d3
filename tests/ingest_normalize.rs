// tests/ingest_normalize.rs
use feedwatch::ingest::{normalize_text, MAX_FIELD_CHARS};

#[test]
fn empty_is_ok() {
    assert_eq!(normalize_text(""), "");
}

#[test]
fn strips_html_and_unescapes() {
    let s = "<p>Cairo&nbsp;<b>unveils</b> &ldquo;reforms&rdquo;</p>";
    assert_eq!(normalize_text(s), r#"Cairo unveils "reforms""#);
}

#[test]
fn folds_whitespace_and_nbsp() {
    let s = "A\u{00A0}\n\tB   C";
    assert_eq!(normalize_text(s), "A B C");
}

#[test]
fn guillemets_become_ascii_quotes() {
    assert_eq!(normalize_text("« L'Égypte »"), r#"" L'Égypte ""#);
}

#[test]
fn length_cap_counts_chars_not_bytes() {
    let s = "م".repeat(MAX_FIELD_CHARS + 500);
    let n = normalize_text(&s);
    assert_eq!(n.chars().count(), MAX_FIELD_CHARS);
}
