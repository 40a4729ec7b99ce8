//! Feature extraction from finalized metric reports.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::config::{clamp_limit, DEFAULT_VOCABULARY_CAP, MAX_VOCABULARY};
use crate::errors::RepolensResult;
use crate::fingerprint::tokenizer::{merge_counts, summarize_tokens, IdentifierTokenizer, Tokenizer};
use crate::fingerprint::{
    Fingerprint, FEATURE_DIMENSION, FEATURE_SCHEMA_VERSION, IDX_COMMENT_RATIO, IDX_COMPLEXITY,
    IDX_ISSUE_DENSITY, IDX_LANGUAGES, IDX_LOG_LOC, IDX_MAINTAINABILITY, IDX_OTHER_LANGUAGE,
    TRACKED_LANGUAGES,
};
use crate::models::{MetricReport, RunSummary};

/// Map a collector language label onto its tracked slot, folding common
/// aliases and file-extension style names.
pub fn tracked_language_slot(language: &str) -> Option<usize> {
    let normalized = language.trim().to_lowercase();
    let canonical = match normalized.as_str() {
        "python" | "py" | "pyw" | "pyx" => "python",
        "javascript" | "js" | "jsx" | "node" => "javascript",
        "typescript" | "ts" | "tsx" => "typescript",
        "java" => "java",
        "c_cpp" | "c" | "cpp" | "c++" | "cc" | "h" | "hpp" => "c_cpp",
        "go" | "golang" => "go",
        "rust" | "rs" => "rust",
        "ruby" | "rb" => "ruby",
        "php" => "php",
        "web" | "html" | "htm" | "css" | "scss" | "sass" => "web",
        _ => return None,
    };
    TRACKED_LANGUAGES.iter().position(|l| *l == canonical)
}

/// LOC share per tracked language plus an "other" bucket, in vector order.
pub fn language_proportions(breakdown: &IndexMap<String, f64>) -> [f64; TRACKED_LANGUAGES.len() + 1] {
    let mut shares = [0.0; TRACKED_LANGUAGES.len() + 1];
    let total: f64 = breakdown.values().filter(|v| **v > 0.0).sum();
    if total <= 0.0 {
        return shares;
    }
    for (language, weight) in breakdown {
        if *weight <= 0.0 {
            continue;
        }
        let slot = tracked_language_slot(language).unwrap_or(TRACKED_LANGUAGES.len());
        shares[slot] += weight / total;
    }
    shares
}

/// Numeric feature vector for a run summary. Pure; used both for fresh
/// reports and for re-fingerprinting stored runs.
pub fn feature_vector(summary: &RunSummary) -> Vec<f64> {
    let mut vector = vec![0.0; FEATURE_DIMENSION];
    vector[IDX_LOG_LOC] = (summary.total_loc as f64).ln_1p();
    vector[IDX_COMPLEXITY] = summary.avg_complexity;
    vector[IDX_MAINTAINABILITY] = summary.avg_maintainability;
    vector[IDX_COMMENT_RATIO] = summary.comment_ratio();
    let shares = language_proportions(&summary.language_breakdown);
    vector[IDX_LANGUAGES..=IDX_OTHER_LANGUAGE].copy_from_slice(&shares);
    vector[IDX_ISSUE_DENSITY] = summary.issue_density();
    vector
}

/// Builds fingerprints from reports. Holds no mutable state, so concurrent
/// extraction needs no locking.
#[derive(Clone)]
pub struct FeatureExtractor {
    tokenizer: Arc<dyn Tokenizer>,
    vocabulary_cap: usize,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_VOCABULARY_CAP)
    }
}

impl std::fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("vocabulary_cap", &self.vocabulary_cap)
            .finish_non_exhaustive()
    }
}

impl FeatureExtractor {
    pub fn new(vocabulary_cap: usize) -> Self {
        Self::with_tokenizer(Arc::new(IdentifierTokenizer), vocabulary_cap)
    }

    pub fn with_tokenizer(tokenizer: Arc<dyn Tokenizer>, vocabulary_cap: usize) -> Self {
        Self {
            tokenizer,
            vocabulary_cap: clamp_limit(vocabulary_cap, MAX_VOCABULARY),
        }
    }

    pub fn vocabulary_cap(&self) -> usize {
        self.vocabulary_cap
    }

    /// Build the fingerprint of a report. Fails with `InvalidReport` before
    /// doing any work when the report's aggregates are unusable.
    pub fn extract(&self, report: &MetricReport) -> RepolensResult<Fingerprint> {
        report.validate()?;
        let summary = RunSummary::from_report(report);

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for text in &report.corpus {
            merge_counts(&mut counts, &self.tokenizer.tokenize(text));
        }
        merge_counts(&mut counts, &report.token_counts);

        Ok(Fingerprint {
            schema_version: FEATURE_SCHEMA_VERSION,
            vector: feature_vector(&summary),
            tokens: summarize_tokens(&counts, self.vocabulary_cap),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Issue;

    fn report() -> MetricReport {
        MetricReport::new(10, 1000, 2.0, 90.0)
            .with_language("py", 0.9)
            .with_language("html", 0.05)
            .with_language("elixir", 0.05)
            .with_comment_lines(100)
            .with_issue(Issue::new("complexity", "High cyclomatic complexity: 12"))
            .with_corpus("def load_config(path): read_config_file(path)")
    }

    #[test]
    fn test_extract_is_deterministic() {
        let extractor = FeatureExtractor::default();
        let a = extractor.extract(&report()).unwrap();
        let b = extractor.extract(&report()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dimension(), FEATURE_DIMENSION);
        assert_eq!(a.schema_version, FEATURE_SCHEMA_VERSION);
    }

    #[test]
    fn test_vector_components() {
        let fp = FeatureExtractor::default().extract(&report()).unwrap();
        assert!((fp.vector[IDX_LOG_LOC] - 1001f64.ln()).abs() < 1e-12);
        assert_eq!(fp.vector[IDX_COMPLEXITY], 2.0);
        assert_eq!(fp.vector[IDX_MAINTAINABILITY], 90.0);
        assert!((fp.vector[IDX_COMMENT_RATIO] - 0.1).abs() < 1e-12);
        let python = tracked_language_slot("python").unwrap();
        assert!((fp.vector[IDX_LANGUAGES + python] - 0.9).abs() < 1e-12);
        assert!((fp.vector[IDX_OTHER_LANGUAGE] - 0.05).abs() < 1e-12);
        assert!((fp.vector[IDX_ISSUE_DENSITY] - 1.0).abs() < 1e-12);
        let share_sum: f64 = fp.vector[IDX_LANGUAGES..=IDX_OTHER_LANGUAGE].iter().sum();
        assert!((share_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_token_summary_from_corpus() {
        let fp = FeatureExtractor::default().extract(&report()).unwrap();
        assert!(fp.tokens.contains_key("config"));
        assert!(fp.tokens.contains_key("path"));
        assert!(!fp.tokens.contains_key("def"));
        let total: f64 = fp.tokens.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_report_is_rejected() {
        let bad = MetricReport::new(1, 10, f64::NAN, 50.0);
        assert!(matches!(
            FeatureExtractor::default().extract(&bad),
            Err(crate::errors::RepolensError::InvalidReport(_))
        ));
    }

    #[test]
    fn test_alias_folding() {
        assert_eq!(tracked_language_slot("JS"), tracked_language_slot("javascript"));
        assert_eq!(tracked_language_slot("cpp"), tracked_language_slot("c_cpp"));
        assert_eq!(tracked_language_slot("cobol"), None);
    }
}
