//! Text normalization and keyword matching shared by the detectors and
//! the trigger engine.
//!
//! Inbound text is matched case- and diacritic-insensitively on word
//! boundaries. Both the inbound text and every configured keyword go
//! through [`normalize`] before comparison, so `"Preço"`, `"preco"` and
//! `"PREÇO"` are the same word. Multi-word phrases match as substrings
//! of the normalized text, still anchored on word boundaries at both
//! ends ("how much" matches "how much does it cost?" but "much" does
//! not match "muchacho").

/// Lowercase the input and strip diacritics from Latin letters.
///
/// # Example
///
/// ```rust
/// use leadflow::textmatch::normalize;
///
/// assert_eq!(normalize("Cancelár"), "cancelar");
/// assert_eq!(normalize("PREÇO à vista"), "preco a vista");
/// ```
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        for lower in ch.to_lowercase() {
            out.push(fold_diacritic(lower));
        }
    }
    out
}

/// Map an already-lowercased Latin letter with a diacritic to its base
/// letter. Everything else passes through unchanged.
fn fold_diacritic(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric()
}

/// Whether `phrase` occurs in `haystack` with word boundaries at both
/// ends. Both arguments must already be normalized.
///
/// An empty phrase never matches.
pub fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    let mut search_from = 0;
    while let Some(rel) = haystack[search_from..].find(phrase) {
        let start = search_from + rel;
        let end = start + phrase.len();
        let boundary_before = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !is_word_char(c));
        let boundary_after = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !is_word_char(c));
        if boundary_before && boundary_after {
            return true;
        }
        // Advance past this occurrence and keep looking.
        search_from = start + phrase.chars().next().map_or(1, |c| c.len_utf8());
    }
    false
}

/// Normalize `text` once and test a raw (unnormalized) keyword against
/// it.
pub fn matches_keyword(normalized_text: &str, keyword: &str) -> bool {
    contains_phrase(normalized_text, &normalize(keyword))
}
