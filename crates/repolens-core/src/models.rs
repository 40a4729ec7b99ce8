//! Shared typed models: upstream metric reports, run summaries, projects and
//! analysis runs.

use std::collections::BTreeMap;
use std::path::{Component, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{RepolensError, RepolensResult};

/// Fields a MetricCollector report must carry before anything downstream
/// looks at it.
pub const REQUIRED_REPORT_FIELDS: &[&str] = &[
    "total_files",
    "total_loc",
    "avg_complexity",
    "avg_maintainability",
    "language_breakdown",
    "issues",
];

// ---------------------------------------------------------------------------
// Project paths
// ---------------------------------------------------------------------------

/// Canonical identity of a project path.
///
/// Expands `~`, resolves symlinks when the path exists and otherwise
/// absolutizes it lexically. Separators are normalized to `/` and trailing
/// slashes are dropped.
pub fn canonical_project_path(path: &str) -> RepolensResult<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(RepolensError::InvalidReport("project path is empty".into()));
    }
    let expanded = expand_tilde(trimmed);
    let resolved = match std::fs::canonicalize(&expanded) {
        Ok(p) => p,
        Err(_) => {
            let absolute = if expanded.is_absolute() {
                expanded
            } else {
                std::env::current_dir()
                    .map_err(|e| RepolensError::Storage(e.to_string()))?
                    .join(&expanded)
            };
            lexical_normalize(&absolute)
        }
    };
    let mut posix = resolved.to_string_lossy().replace('\\', "/");
    while posix.len() > 1 && posix.ends_with('/') {
        posix.pop();
    }
    Ok(posix)
}

/// Last path component, used as the project's display name.
pub fn project_display_name(canonical_path: &str) -> String {
    canonical_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(canonical_path)
        .to_string()
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

fn lexical_normalize(path: &std::path::Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// A single issue detected by the upstream collector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl Issue {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            rule: None,
            message: message.into(),
            file: None,
            line: None,
            severity: None,
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }
}

/// Collectors emit either structured issues or bare message strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum IssueShape {
    Structured(Issue),
    Text(String),
}

impl From<IssueShape> for Issue {
    fn from(shape: IssueShape) -> Self {
        match shape {
            IssueShape::Structured(issue) => issue,
            IssueShape::Text(message) => Issue::new("general", message),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricReport
// ---------------------------------------------------------------------------

/// Finalized per-project report produced by the MetricCollector.
///
/// `language_breakdown` values are LOC counts or shares; only their relative
/// magnitude matters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub total_files: u64,
    pub total_loc: u64,
    pub avg_complexity: f64,
    pub avg_maintainability: f64,
    pub language_breakdown: IndexMap<String, f64>,
    pub issues: Vec<Issue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_issues: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_lines: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corpus: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub token_counts: BTreeMap<String, u64>,
}

#[derive(Deserialize)]
struct RawReport {
    total_files: u64,
    total_loc: u64,
    avg_complexity: f64,
    avg_maintainability: f64,
    language_breakdown: IndexMap<String, f64>,
    issues: Vec<IssueShape>,
    #[serde(default)]
    total_issues: Option<u64>,
    #[serde(default)]
    comment_lines: Option<u64>,
    #[serde(default)]
    corpus: Vec<String>,
    #[serde(default)]
    token_counts: BTreeMap<String, u64>,
}

impl MetricReport {
    pub fn new(
        total_files: u64,
        total_loc: u64,
        avg_complexity: f64,
        avg_maintainability: f64,
    ) -> Self {
        Self {
            total_files,
            total_loc,
            avg_complexity,
            avg_maintainability,
            language_breakdown: IndexMap::new(),
            issues: Vec::new(),
            total_issues: None,
            comment_lines: None,
            corpus: Vec::new(),
            token_counts: BTreeMap::new(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>, share: f64) -> Self {
        self.language_breakdown.insert(language.into(), share);
        self
    }

    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.issues.push(issue);
        self
    }

    pub fn with_comment_lines(mut self, lines: u64) -> Self {
        self.comment_lines = Some(lines);
        self
    }

    pub fn with_corpus(mut self, text: impl Into<String>) -> Self {
        self.corpus.push(text.into());
        self
    }

    /// Validate a loosely-shaped JSON report against the required-field
    /// schema and convert it.
    pub fn from_value(value: &serde_json::Value) -> RepolensResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| RepolensError::InvalidReport("report must be a JSON object".into()))?;
        let missing: Vec<&str> = REQUIRED_REPORT_FIELDS
            .iter()
            .copied()
            .filter(|field| obj.get(*field).map_or(true, |v| v.is_null()))
            .collect();
        if !missing.is_empty() {
            return Err(RepolensError::InvalidReport(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        let raw: RawReport = serde_json::from_value(value.clone())
            .map_err(|e| RepolensError::InvalidReport(e.to_string()))?;
        let report = MetricReport {
            total_files: raw.total_files,
            total_loc: raw.total_loc,
            avg_complexity: raw.avg_complexity,
            avg_maintainability: raw.avg_maintainability,
            language_breakdown: raw.language_breakdown,
            issues: raw.issues.into_iter().map(Issue::from).collect(),
            total_issues: raw.total_issues,
            comment_lines: raw.comment_lines,
            corpus: raw.corpus,
            token_counts: raw.token_counts,
        };
        report.validate()?;
        Ok(report)
    }

    /// Reject aggregates that would poison the feature vector.
    pub fn validate(&self) -> RepolensResult<()> {
        check_storable("total_files", self.total_files)?;
        check_storable("total_loc", self.total_loc)?;
        check_storable("total_issues", self.issue_count())?;
        check_finite("avg_complexity", self.avg_complexity)?;
        check_finite("avg_maintainability", self.avg_maintainability)?;
        for (language, share) in &self.language_breakdown {
            if language.trim().is_empty() {
                return Err(RepolensError::InvalidReport(
                    "language_breakdown contains an empty language name".into(),
                ));
            }
            check_finite(&format!("language_breakdown.{language}"), *share)?;
        }
        if let Some(comments) = self.comment_lines {
            if comments > self.total_loc {
                return Err(RepolensError::InvalidReport(format!(
                    "comment_lines ({comments}) exceeds total_loc ({})",
                    self.total_loc
                )));
            }
        }
        for issue in &self.issues {
            if issue.category.trim().is_empty() {
                return Err(RepolensError::InvalidReport(
                    "issue with empty category".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn issue_count(&self) -> u64 {
        self.total_issues
            .unwrap_or(self.issues.len() as u64)
            .max(self.issues.len() as u64)
    }

    /// SHA-256 over the canonical JSON encoding of the report.
    pub fn digest(&self) -> RepolensResult<String> {
        let encoded = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Counts are stored as SQLite INTEGER, which is signed 64-bit.
fn check_storable(field: &str, value: u64) -> RepolensResult<()> {
    if value > i64::MAX as u64 {
        return Err(RepolensError::InvalidReport(format!(
            "{field} ({value}) is too large to store"
        )));
    }
    Ok(())
}

fn check_finite(field: &str, value: f64) -> RepolensResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(RepolensError::InvalidReport(format!(
            "{field} must be a finite non-negative number, got {value}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RunSummary / AnalysisRun / Project
// ---------------------------------------------------------------------------

/// Aggregate statistics stored with every analysis run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_files: u64,
    pub total_loc: u64,
    pub avg_complexity: f64,
    pub avg_maintainability: f64,
    pub total_issues: u64,
    pub comment_lines: u64,
    pub language_breakdown: IndexMap<String, f64>,
}

impl RunSummary {
    pub fn from_report(report: &MetricReport) -> Self {
        Self {
            total_files: report.total_files,
            total_loc: report.total_loc,
            avg_complexity: report.avg_complexity,
            avg_maintainability: report.avg_maintainability,
            total_issues: report.issue_count(),
            comment_lines: report.comment_lines.unwrap_or(0),
            language_breakdown: report.language_breakdown.clone(),
        }
    }

    pub fn comment_ratio(&self) -> f64 {
        if self.total_loc == 0 {
            return 0.0;
        }
        self.comment_lines as f64 / self.total_loc as f64
    }

    /// Issues per thousand lines of code.
    pub fn issue_density(&self) -> f64 {
        if self.total_loc == 0 {
            return 0.0;
        }
        self.total_issues as f64 * 1000.0 / self.total_loc as f64
    }
}

/// One immutable, recorded analysis of a project.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub run_id: i64,
    pub project_path: String,
    pub timestamp: DateTime<Utc>,
    pub summary: RunSummary,
    pub issues: Vec<Issue>,
    pub report_digest: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_analyzed_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a project with respect to analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Unknown,
    Analyzing,
    Analyzed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_value() -> serde_json::Value {
        json!({
            "total_files": 12,
            "total_loc": 1000,
            "avg_complexity": 2.5,
            "avg_maintainability": 80.0,
            "language_breakdown": {"python": 900, "web": 100},
            "issues": [
                "File too long: 612 lines",
                {"category": "complexity", "rule": "cc-max", "message": "High cyclomatic complexity: 14",
                 "file": "src/app.py", "line": 10}
            ]
        })
    }

    #[test]
    fn test_from_value_accepts_mixed_issue_shapes() {
        let report = MetricReport::from_value(&sample_value()).unwrap();
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.issues[0].category, "general");
        assert_eq!(report.issues[1].rule.as_deref(), Some("cc-max"));
        assert_eq!(report.issue_count(), 2);
        let langs: Vec<&str> = report.language_breakdown.keys().map(|k| k.as_str()).collect();
        assert_eq!(langs, vec!["python", "web"]);
    }

    #[test]
    fn test_from_value_reports_missing_fields() {
        let mut value = sample_value();
        value.as_object_mut().unwrap().remove("total_loc");
        value.as_object_mut().unwrap().insert("issues".into(), json!(null));
        let err = MetricReport::from_value(&value).unwrap_err();
        match err {
            RepolensError::InvalidReport(msg) => {
                assert!(msg.contains("total_loc"));
                assert!(msg.contains("issues"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_value_rejects_negative_aggregates() {
        let mut value = sample_value();
        value["avg_complexity"] = json!(-1.0);
        assert!(matches!(
            MetricReport::from_value(&value),
            Err(RepolensError::InvalidReport(_))
        ));
        assert!(matches!(
            MetricReport::from_value(&json!([1, 2])),
            Err(RepolensError::InvalidReport(_))
        ));
    }

    #[test]
    fn test_counts_beyond_sqlite_integer_are_rejected() {
        let huge = i64::MAX as u64 + 1;
        for report in [
            MetricReport::new(huge, 10, 1.0, 50.0),
            MetricReport::new(1, huge, 1.0, 50.0),
            MetricReport {
                total_issues: Some(huge),
                ..MetricReport::new(1, 10, 1.0, 50.0)
            },
        ] {
            assert!(matches!(report.validate(), Err(RepolensError::InvalidReport(_))));
        }
        assert!(MetricReport::new(1, i64::MAX as u64, 1.0, 50.0).validate().is_ok());

        let mut value = sample_value();
        value["total_loc"] = json!(u64::MAX);
        assert!(matches!(
            MetricReport::from_value(&value),
            Err(RepolensError::InvalidReport(_))
        ));
    }

    #[test]
    fn test_summary_ratios() {
        let report = MetricReport::new(3, 2000, 1.0, 70.0)
            .with_comment_lines(200)
            .with_issue(Issue::new("style", "x"))
            .with_issue(Issue::new("style", "y"));
        let summary = RunSummary::from_report(&report);
        assert!((summary.comment_ratio() - 0.1).abs() < 1e-12);
        assert!((summary.issue_density() - 1.0).abs() < 1e-12);
        let empty = RunSummary::from_report(&MetricReport::new(0, 0, 0.0, 0.0));
        assert_eq!(empty.issue_density(), 0.0);
    }

    #[test]
    fn test_digest_is_stable() {
        let a = MetricReport::from_value(&sample_value()).unwrap();
        let b = MetricReport::from_value(&sample_value()).unwrap();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap().len(), 64);
    }

    #[test]
    fn test_canonical_project_path_normalizes() {
        let path = canonical_project_path("/tmp/repolens-missing/./a/../b/").unwrap();
        assert_eq!(path, "/tmp/repolens-missing/b");
        assert_eq!(project_display_name(&path), "b");
        assert!(canonical_project_path("   ").is_err());
    }
}
