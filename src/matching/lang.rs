// src/matching/lang.rs
//! Dominant-language detection for article text.
//!
//! Arabic gets a quick letter-ratio check first; other non-Latin scripts are
//! identified by code-point ranges; Latin text is scored against small
//! stop-word lists. `"und"` when nothing is conclusive.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use super::normalize::is_arabic_letter;

/// Arabic letters above this share of all letters => "ar".
pub const ARABIC_RATIO: f32 = 0.3;
const SCRIPT_RATIO: f32 = 0.3;

pub const UNDETERMINED: &str = "und";

static STOPWORDS: Lazy<Vec<(&'static str, HashSet<&'static str>)>> = Lazy::new(|| {
    let table: [(&str, &[&str]); 6] = [
        ("en", &["the", "and", "of", "to", "in", "is", "that", "for", "on", "with", "was", "said", "by", "from", "has", "its"]),
        ("fr", &["le", "la", "les", "des", "et", "est", "une", "dans", "du", "pour", "que", "qui", "sur", "pas", "au", "avec"]),
        ("es", &["el", "los", "las", "del", "y", "es", "una", "en", "por", "que", "con", "para", "se", "su", "al", "como"]),
        ("de", &["der", "die", "das", "und", "ist", "nicht", "ein", "eine", "mit", "von", "den", "zu", "im", "auf", "sich", "dem"]),
        ("it", &["il", "gli", "della", "di", "che", "è", "una", "per", "non", "con", "sono", "nel", "alla", "anche", "più", "dei"]),
        ("pt", &["o", "os", "da", "do", "que", "não", "uma", "em", "para", "com", "por", "mais", "dos", "como", "foi", "ao"]),
    ];
    table
        .into_iter()
        .map(|(lang, words)| (lang, words.iter().copied().collect()))
        .collect()
});

#[derive(Default)]
struct ScriptCounts {
    letters: usize,
    arabic: usize,
    han: usize,
    kana: usize,
    hangul: usize,
    cyrillic: usize,
    greek: usize,
}

fn count_scripts(text: &str) -> ScriptCounts {
    let mut c = ScriptCounts::default();
    for ch in text.chars().filter(|ch| ch.is_alphabetic()) {
        c.letters += 1;
        match ch {
            _ if is_arabic_letter(ch) => c.arabic += 1,
            '\u{3040}'..='\u{30FF}' | '\u{31F0}'..='\u{31FF}' => c.kana += 1,
            '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' => c.han += 1,
            '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}' => c.hangul += 1,
            '\u{0400}'..='\u{04FF}' => c.cyrillic += 1,
            '\u{0370}'..='\u{03FF}' => c.greek += 1,
            _ => {}
        }
    }
    c
}

/// ISO 639-1 code of the dominant language, or `"und"`.
pub fn detect_language(text: &str) -> &'static str {
    let c = count_scripts(text);
    if c.letters == 0 {
        return UNDETERMINED;
    }
    let share = |n: usize| n as f32 / c.letters as f32;

    if share(c.arabic) > ARABIC_RATIO {
        return "ar";
    }
    // Japanese mixes kanji with kana; any real amount of kana decides it.
    if share(c.kana) > 0.1 {
        return "ja";
    }
    if share(c.hangul) > SCRIPT_RATIO {
        return "ko";
    }
    if share(c.han) > SCRIPT_RATIO {
        return "zh";
    }
    if share(c.cyrillic) > SCRIPT_RATIO {
        return "ru";
    }
    if share(c.greek) > SCRIPT_RATIO {
        return "el";
    }

    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|ch: char| !ch.is_alphanumeric() && ch != '\'')
        .filter(|w| !w.is_empty())
        .collect();

    let mut best = (UNDETERMINED, 0usize);
    for (lang, stops) in STOPWORDS.iter() {
        let score = words.iter().filter(|w| stops.contains(**w)).count();
        if score > best.1 {
            best = (*lang, score);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arabic_quick_check() {
        assert_eq!(detect_language("أعلنت مصر عن سياسة جديدة"), "ar");
        // mostly Arabic with an embedded Latin brand
        assert_eq!(detect_language("شركة Apple تعلن عن منتج جديد في القاهرة"), "ar");
    }

    #[test]
    fn scripts() {
        assert_eq!(detect_language("埃及宣布新政策"), "zh");
        assert_eq!(detect_language("エジプトが新しい政策を発表"), "ja");
        assert_eq!(detect_language("이집트가 새로운 정책을 발표했다"), "ko");
        assert_eq!(detect_language("Египет объявил о новой политике"), "ru");
    }

    #[test]
    fn latin_stopwords() {
        assert_eq!(detect_language("Egypt announces a new policy on the economy"), "en");
        assert_eq!(detect_language("L'Égypte annonce une nouvelle politique pour les entreprises"), "fr");
        assert_eq!(detect_language("Egipto anuncia una nueva política para los mercados"), "es");
        assert_eq!(detect_language("Ägypten kündigt eine neue Politik an und die Märkte reagieren"), "de");
    }

    #[test]
    fn undetermined() {
        assert_eq!(detect_language(""), "und");
        assert_eq!(detect_language("12345 !!!"), "und");
        assert_eq!(detect_language("Xyzzy Plugh"), "und");
    }
}
