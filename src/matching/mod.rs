// src/matching/mod.rs
//! Strict lexical matching of articles against expanded keywords.
//!
//! Every keyword is evaluated against every article (no early exit), and every
//! variant of a keyword is tried whatever the detected article language is.
//! Boundary rules depend on the variant's script:
//! - alphabetic scripts: no letter or digit directly before or after;
//! - Arabic: optional one-letter clitic and/or `ال` in front, no Arabic letter
//!   directly before or after;
//! - CJK and other unsegmented scripts: plain substring.

pub mod context;
pub mod lang;
pub mod normalize;

use std::collections::HashSet;

use metrics::counter;
use regex::Regex;

use crate::expansion::KeywordExpansion;
use crate::types::{FetchedArticle, KeywordMatch, MatchRecord, VariantHit};
use normalize::{normalize, NormalizedText, Script};

const ARABIC_LETTER_CLASS: &str = r"\x{0621}-\x{064A}\x{0671}-\x{06D3}\x{06FA}-\x{06FF}";

enum Pattern {
    /// Capture group 1 is the term itself.
    Bounded(Regex),
    Substring(String),
}

struct CompiledVariant {
    variant: String,
    language: String,
    pattern: Pattern,
}

struct CompiledKeyword {
    keyword: String,
    variants: Vec<CompiledVariant>,
}

/// Build the pattern for one normalized variant.
fn compile_variant(normalized: &str) -> Option<Pattern> {
    let escaped = regex::escape(normalized);
    let src = match Script::of(normalized) {
        Script::Unsegmented => return Some(Pattern::Substring(normalized.to_string())),
        Script::Alphabetic => format!(r"(?:^|[^\p{{L}}\p{{N}}])({escaped})(?:[^\p{{L}}\p{{N}}]|$)"),
        Script::Arabic => format!(
            r"(?:^|[^{c}])(?:[وفبلك])?(?:ال)?({escaped})(?:[^{c}]|$)",
            c = ARABIC_LETTER_CLASS
        ),
    };
    match Regex::new(&src) {
        Ok(re) => Some(Pattern::Bounded(re)),
        Err(e) => {
            tracing::warn!(target: "matching", variant = normalized, error = %e, "variant pattern rejected");
            None
        }
    }
}

impl CompiledVariant {
    /// First occurrence as `(byte_start, byte_end)` in the normalized text.
    fn find(&self, text: &str) -> Option<(usize, usize)> {
        match &self.pattern {
            Pattern::Bounded(re) => re
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| (m.start(), m.end())),
            Pattern::Substring(s) => text.find(s.as_str()).map(|start| (start, start + s.len())),
        }
    }
}

/// Compiled keyword set for one run.
pub struct MatchingEngine {
    keywords: Vec<CompiledKeyword>,
}

impl MatchingEngine {
    /// Compile every usable expansion. Unusable ones are skipped.
    pub fn new(expansions: &[KeywordExpansion]) -> Self {
        let mut keywords = Vec::with_capacity(expansions.len());
        for exp in expansions {
            if !exp.is_usable() {
                tracing::warn!(target: "matching", keyword = %exp.keyword, "skipping keyword without usable expansion");
                continue;
            }
            let mut seen = HashSet::new();
            let mut variants = Vec::new();
            for (language, variant) in exp.all_variants() {
                let norm = normalize(variant).text;
                if norm.is_empty() || !seen.insert(norm.clone()) {
                    continue;
                }
                if let Some(pattern) = compile_variant(&norm) {
                    variants.push(CompiledVariant {
                        variant: variant.to_string(),
                        language: language.to_string(),
                        pattern,
                    });
                }
            }
            if !variants.is_empty() {
                keywords.push(CompiledKeyword {
                    keyword: exp.keyword.clone(),
                    variants,
                });
            }
        }
        Self { keywords }
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    pub fn variant_count(&self) -> usize {
        self.keywords.iter().map(|k| k.variants.len()).sum()
    }

    /// Every keyword with at least one matching variant. Hit offsets are char
    /// offsets into `text`.
    pub fn match_text(&self, text: &str) -> Vec<KeywordMatch> {
        let norm = normalize(text);
        if norm.is_empty() {
            return Vec::new();
        }
        self.keywords
            .iter()
            .filter_map(|kw| {
                let hits: Vec<VariantHit> = kw
                    .variants
                    .iter()
                    .filter_map(|v| hit_for(v, &norm))
                    .collect();
                (!hits.is_empty()).then(|| KeywordMatch {
                    keyword: kw.keyword.clone(),
                    hits,
                })
            })
            .collect()
    }

    pub fn match_article(&self, article: FetchedArticle) -> Option<MatchRecord> {
        let text = article.searchable_text();
        let matches = self.match_text(&text);
        if matches.is_empty() {
            return None;
        }
        counter!("match_total").increment(1);
        Some(MatchRecord {
            language: lang::detect_language(&text).to_string(),
            article,
            matches,
        })
    }

    /// Matching records, in input order.
    pub fn match_articles(&self, articles: Vec<FetchedArticle>) -> Vec<MatchRecord> {
        articles
            .into_iter()
            .filter_map(|a| self.match_article(a))
            .collect()
    }
}

fn hit_for(v: &CompiledVariant, norm: &NormalizedText) -> Option<VariantHit> {
    let (start_b, end_b) = v.find(&norm.text)?;
    let start = norm.char_index(start_b);
    let len = norm.text[start_b..end_b].chars().count();
    let (offset, length) = norm.source_span(start, len)?;
    Some(VariantHit {
        variant: v.variant.clone(),
        language: v.language.clone(),
        offset,
        length,
    })
}
