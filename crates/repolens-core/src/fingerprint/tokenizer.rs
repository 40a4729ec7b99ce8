//! Tokenizer seam and token-summary construction.
//!
//! Source parsing belongs to the collector; the core only needs a mapping
//! from raw text to token counts. [`IdentifierTokenizer`] is the default.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap());

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // english
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have",
        "if", "in", "into", "is", "it", "its", "not", "of", "on", "or", "so", "that", "the",
        "then", "there", "these", "this", "to", "was", "we", "were", "will", "with", "you",
        // code keywords
        "def", "fn", "let", "var", "const", "function", "class", "struct", "enum", "impl",
        "import", "return", "self", "public", "private", "protected", "static", "void", "int",
        "str", "string", "bool", "true", "false", "null", "none", "nil", "new", "else", "elif",
        "while", "pass", "use", "mut", "pub", "async", "await", "try", "except", "catch",
        "throw", "lambda", "package", "func", "type", "interface", "extends", "implements",
    ]
    .into_iter()
    .collect()
});

/// Maps raw text to token counts.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> BTreeMap<String, u64>;
}

/// Splits identifiers on snake_case and camelCase boundaries and lowercases
/// the parts.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentifierTokenizer;

impl Tokenizer for IdentifierTokenizer {
    fn tokenize(&self, text: &str) -> BTreeMap<String, u64> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for ident in IDENT_RE.find_iter(text) {
            for part in ident.as_str().split('_').filter(|p| !p.is_empty()) {
                for piece in split_camel(part) {
                    *counts.entry(piece.to_lowercase()).or_insert(0) += 1;
                }
            }
        }
        counts
    }
}

/// `parseHTTPRequest` -> `parse`, `HTTP`, `Request`.
fn split_camel(word: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    let mut pieces = Vec::new();
    let mut start = 0;
    for i in 1..chars.len() {
        let (idx, cur) = chars[i];
        let prev = chars[i - 1].1;
        let next_is_lower = chars.get(i + 1).is_some_and(|(_, c)| c.is_lowercase());
        let boundary = cur.is_uppercase()
            && (prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower));
        if boundary {
            pieces.push(&word[start..idx]);
            start = idx;
        }
    }
    pieces.push(&word[start..]);
    pieces
}

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(token)
}

fn keep_token(token: &str) -> bool {
    token.chars().count() >= 2
        && !token.chars().all(|c| c.is_ascii_digit())
        && !is_stopword(token)
}

/// Filter stopwords, cap the vocabulary at `cap` most frequent tokens (ties
/// broken by token order) and convert counts to relative frequencies.
pub fn summarize_tokens(counts: &BTreeMap<String, u64>, cap: usize) -> BTreeMap<String, f64> {
    let mut kept: Vec<(&String, u64)> = counts
        .iter()
        .filter(|(token, count)| **count > 0 && keep_token(token))
        .map(|(token, count)| (token, *count))
        .collect();
    kept.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    kept.truncate(cap);

    let total: u64 = kept.iter().map(|(_, c)| *c).sum();
    if total == 0 {
        return BTreeMap::new();
    }
    kept.into_iter()
        .map(|(token, count)| (token.clone(), count as f64 / total as f64))
        .collect()
}

pub fn merge_counts(target: &mut BTreeMap<String, u64>, source: &BTreeMap<String, u64>) {
    for (token, count) in source {
        *target.entry(token.to_lowercase()).or_insert(0) += count;
    }
}
