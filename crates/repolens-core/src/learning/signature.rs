//! Issue signature normalization.
//!
//! A signature names an issue class independent of where it occurred:
//! `category:rule`, lowercased, with file paths, identifiers, line numbers
//! and other numbers replaced by placeholders.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::Issue;

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:[A-Za-z]:)?[\w.\-]*(?:[/\\][\w.\-]+)+|\b[\w\-]+\.(?:py|pyx|js|jsx|ts|tsx|java|c|cc|cpp|h|hpp|go|rs|rb|php|html|css|scss)\b",
    )
    .unwrap()
});
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"`[^`]*`|'[^']*'|"[^"]*""#).unwrap());
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blines?\s+\d+").unwrap());
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?%?").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip occurrence-specific details out of an issue message.
pub fn normalize_message(message: &str) -> String {
    let text = PATH_RE.replace_all(message, "<path>");
    let text = QUOTED_RE.replace_all(&text, "<id>");
    let text = LINE_RE.replace_all(&text, "line <n>");
    let text = NUMBER_RE.replace_all(&text, "<n>");
    WS_RE.replace_all(text.trim(), " ").to_lowercase()
}

pub fn normalize_category(category: &str) -> String {
    let trimmed = category.trim().to_lowercase();
    WS_RE.replace_all(&trimmed, "_").into_owned()
}

/// `category:rule` for an issue, deriving the rule from the message when
/// the collector supplied no explicit rule id.
pub fn issue_signature(issue: &Issue) -> String {
    let category = normalize_category(&issue.category);
    let rule = match issue.rule.as_deref().map(str::trim) {
        Some(rule) if !rule.is_empty() => rule.to_lowercase(),
        _ => normalize_message(&issue.message),
    };
    format!("{category}:{rule}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_rule_wins() {
        let issue = Issue::new("Complexity", "High cyclomatic complexity: 14").with_rule("CC-Max");
        assert_eq!(issue_signature(&issue), "complexity:cc-max");
    }

    #[test]
    fn message_details_are_stripped() {
        let a = Issue::new("complexity", "Function `parse_args` in src/cli.py line 88 has complexity 14");
        let b = Issue::new("complexity", "Function `load` in lib/io/reader.py line 3 has complexity 9");
        assert_eq!(issue_signature(&a), issue_signature(&b));
        assert_eq!(
            issue_signature(&a),
            "complexity:function <id> in <path> line <n> has complexity <n>"
        );
    }

    #[test]
    fn numbers_and_percents_collapse() {
        assert_eq!(
            normalize_message("Comment ratio 3.5%  below   10%"),
            "comment ratio <n> below <n>"
        );
        assert_eq!(normalize_message("File too long: 612 lines"), "file too long: <n> lines");
        assert_eq!(normalize_message("Unused import 'os' in app.py"), "unused import <id> in <path>");
    }

    #[test]
    fn category_whitespace_is_folded() {
        assert_eq!(normalize_category("  Code Style "), "code_style");
    }
}
