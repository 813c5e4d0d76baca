//! Tokenisation for the full-text column.
//!
//! Words are lowercased runs of letters/digits; CJK ideographs and kana are
//! emitted one character per token since they carry no whitespace.

use regex::Regex;
use std::sync::LazyLock;

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Han}\p{Hiragana}\p{Katakana}]|[[\p{L}\p{N}_]--[\p{Han}\p{Hiragana}\p{Katakana}]]+")
        .expect("static token pattern")
});

/// Split `text` into lowercase tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Space-joined tokens stored in `content_tokens`.
pub fn content_tokens(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Length of `text` in Unicode scalar values.
pub fn rune_count(text: &str) -> usize {
    text.chars().count()
}

/// Build an FTS5 MATCH expression that ORs every distinct query token.
///
/// Returns `None` when the query carries no searchable token.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
    let terms: Vec<String> = tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}
