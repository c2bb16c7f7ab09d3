// src/matching/normalize.rs
//! Text normalization for matching.
//!
//! The normalized string keeps, for every char, the index of the source char it
//! came from, so hits found in normalized text can be reported against the
//! original text.

/// Invisible formatting chars: zero-width (200B-200F incl. LRM/RLM), bidi
/// embeddings/overrides (202A-202E), isolates (2066-2069), BOM, Arabic letter mark.
pub fn is_invisible_control(c: char) -> bool {
    matches!(c,
        '\u{200B}'..='\u{200F}'
        | '\u{202A}'..='\u{202E}'
        | '\u{2066}'..='\u{2069}'
        | '\u{FEFF}'
        | '\u{061C}')
}

/// Arabic letters proper (hamza..yeh plus the extended block used by Persian/Urdu).
pub fn is_arabic_letter(c: char) -> bool {
    matches!(c, '\u{0621}'..='\u{064A}' | '\u{0671}'..='\u{06D3}' | '\u{06FA}'..='\u{06FF}')
}

/// Harakat, superscript alef and tatweel.
fn is_arabic_mark(c: char) -> bool {
    matches!(c, '\u{064B}'..='\u{065F}' | '\u{0670}' | '\u{0640}')
}

fn fold_arabic(c: char) -> char {
    match c {
        'أ' | 'إ' | 'آ' | 'ٱ' => 'ا',
        'ى' => 'ي',
        'ة' => 'ه',
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedText {
    pub text: String,
    /// `origin[i]` = source char index of normalized char `i`.
    origin: Vec<usize>,
}

impl NormalizedText {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Map a normalized char span to `(source_offset, source_len)` in chars.
    pub fn source_span(&self, start: usize, len: usize) -> Option<(usize, usize)> {
        if len == 0 || start + len > self.origin.len() {
            return None;
        }
        let first = self.origin[start];
        let last = self.origin[start + len - 1];
        Some((first, last + 1 - first))
    }

    /// Convert a byte offset into `text` to a char index.
    pub fn char_index(&self, byte_offset: usize) -> usize {
        self.text
            .char_indices()
            .take_while(|(b, _)| *b < byte_offset)
            .count()
    }
}

/// Language-agnostic pipeline plus the Arabic pass: strip invisible controls,
/// collapse whitespace, trim, lowercase, unify alef/yaa/taa marbuta, drop
/// harakat and tatweel.
///
/// The Arabic pass only rewrites Arabic code points, so it runs on every input.
pub fn normalize(input: &str) -> NormalizedText {
    let mut text = String::with_capacity(input.len());
    let mut origin = Vec::with_capacity(input.len());
    let mut pending_space: Option<usize> = None;

    for (idx, c) in input.chars().enumerate() {
        if is_invisible_control(c) || is_arabic_mark(c) {
            continue;
        }
        if c.is_whitespace() {
            if !origin.is_empty() && pending_space.is_none() {
                pending_space = Some(idx);
            }
            continue;
        }
        if let Some(ws) = pending_space.take() {
            text.push(' ');
            origin.push(ws);
        }
        for lc in c.to_lowercase() {
            text.push(fold_arabic(lc));
            origin.push(idx);
        }
    }

    NormalizedText { text, origin }
}

/// Matching strategy implied by a variant's script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Latin, Cyrillic, Greek: whole-word matches only.
    Alphabetic,
    /// Clitic-aware pattern with Arabic-letter boundaries.
    Arabic,
    /// CJK and anything else without spaces between words.
    Unsegmented,
}

impl Script {
    /// Dominant script among the letters of `s`. No letters at all counts as alphabetic.
    pub fn of(s: &str) -> Script {
        let (mut alpha, mut arabic, mut other) = (0usize, 0usize, 0usize);
        for c in s.chars().filter(|c| c.is_alphabetic()) {
            if is_arabic_letter(c) {
                arabic += 1;
            } else if is_bounded_alphabet(c) {
                alpha += 1;
            } else {
                other += 1;
            }
        }
        if arabic > 0 && arabic >= alpha && arabic >= other {
            Script::Arabic
        } else if other > alpha {
            Script::Unsegmented
        } else {
            Script::Alphabetic
        }
    }
}

/// Latin (incl. extended/IPA), Greek, Cyrillic, Armenian.
fn is_bounded_alphabet(c: char) -> bool {
    c.is_ascii_alphabetic()
        || matches!(c,
            '\u{00C0}'..='\u{024F}'
            | '\u{0250}'..='\u{02AF}'
            | '\u{0370}'..='\u{03FF}'
            | '\u{0400}'..='\u{052F}'
            | '\u{0530}'..='\u{058F}'
            | '\u{1E00}'..='\u{1EFF}')
}
