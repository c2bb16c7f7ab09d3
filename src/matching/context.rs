// src/matching/context.rs
//! Word window around a match, shown to tenants as the reason an article was kept.

use serde::{Deserialize, Serialize};

use crate::translate::{TranslateError, Translator};
use crate::types::VariantHit;

pub const ELLIPSIS: char = '…';

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub words_before: usize,
    pub words_after: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            words_before: 20,
            words_after: 20,
        }
    }
}

/// `before` and `after` carry their own spacing towards the match, so a clitic
/// glued to the term stays glued when rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchContext {
    pub before: String,
    pub matched: String,
    pub after: String,
    pub truncated_start: bool,
    pub truncated_end: bool,
}

impl MatchContext {
    /// `… before **matched** after …`
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.truncated_start {
            out.push(ELLIPSIS);
            out.push(' ');
        }
        out.push_str(&self.before);
        out.push_str("**");
        out.push_str(&self.matched);
        out.push_str("**");
        out.push_str(&self.after);
        if self.truncated_end {
            out.push(' ');
            out.push(ELLIPSIS);
        }
        out
    }
}

/// Window of `cfg.words_before` / `cfg.words_after` words around the hit.
/// `None` when the hit does not fit the text.
pub fn extract_context(text: &str, hit: &VariantHit, cfg: &ContextConfig) -> Option<MatchContext> {
    let chars: Vec<char> = text.chars().collect();
    let end = hit.offset.checked_add(hit.length)?;
    if hit.length == 0 || end > chars.len() {
        return None;
    }
    let head: String = chars[..hit.offset].iter().collect();
    let matched: String = chars[hit.offset..end].iter().collect();
    let tail: String = chars[end..].iter().collect();

    let head_words: Vec<&str> = head.split_whitespace().collect();
    let skip = head_words.len().saturating_sub(cfg.words_before);
    let mut before = head_words[skip..].join(" ");
    if !before.is_empty() && head.ends_with(char::is_whitespace) {
        before.push(' ');
    }

    let tail_words: Vec<&str> = tail.split_whitespace().collect();
    let take = tail_words.len().min(cfg.words_after);
    let mut after = String::new();
    if take > 0 {
        if tail.starts_with(char::is_whitespace) {
            after.push(' ');
        }
        after.push_str(&tail_words[..take].join(" "));
    }

    Some(MatchContext {
        before,
        matched,
        after,
        truncated_start: skip > 0,
        truncated_end: tail_words.len() > take,
    })
}

/// Window with the surrounding words translated into `target`; the matched
/// span keeps its original form.
pub async fn extract_translated(
    text: &str,
    hit: &VariantHit,
    cfg: &ContextConfig,
    translator: &dyn Translator,
    target: &str,
) -> Result<Option<MatchContext>, TranslateError> {
    let Some(mut ctx) = extract_context(text, hit, cfg) else {
        return Ok(None);
    };
    if !ctx.before.trim().is_empty() {
        let glued = !ctx.before.ends_with(' ');
        let mut t = translator.translate(ctx.before.trim(), target).await?;
        if !glued {
            t.push(' ');
        }
        ctx.before = t;
    }
    if !ctx.after.trim().is_empty() {
        let spaced = ctx.after.starts_with(' ');
        let t = translator.translate(ctx.after.trim(), target).await?;
        ctx.after = if spaced { format!(" {t}") } else { t };
    }
    Ok(Some(ctx))
}

/// Rendered context for a tenant reading in `display_lang`. Translation is
/// skipped when the article is already in that language and falls back to the
/// original window when the translator fails.
pub async fn context_for_display(
    text: &str,
    hit: &VariantHit,
    cfg: &ContextConfig,
    translator: &dyn Translator,
    article_lang: &str,
    display_lang: &str,
) -> Option<String> {
    if display_lang.is_empty() || article_lang == display_lang {
        return extract_context(text, hit, cfg).map(|c| c.render());
    }
    match extract_translated(text, hit, cfg, translator, display_lang).await {
        Ok(ctx) => ctx.map(|c| c.render()),
        Err(e) => {
            tracing::debug!(target: "context", error = %e, "context translation failed, using original window");
            extract_context(text, hit, cfg).map(|c| c.render())
        }
    }
}
