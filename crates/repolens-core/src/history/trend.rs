//! Trend series and run-over-run deltas.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::RepolensError;
use crate::models::{AnalysisRun, RunSummary};

/// Summary metric that can be charted over a project's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    TotalFiles,
    TotalLoc,
    AvgComplexity,
    AvgMaintainability,
    TotalIssues,
    CommentRatio,
    IssueDensity,
}

impl MetricName {
    pub const ALL: [MetricName; 7] = [
        MetricName::TotalFiles,
        MetricName::TotalLoc,
        MetricName::AvgComplexity,
        MetricName::AvgMaintainability,
        MetricName::TotalIssues,
        MetricName::CommentRatio,
        MetricName::IssueDensity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::TotalFiles => "total_files",
            MetricName::TotalLoc => "total_loc",
            MetricName::AvgComplexity => "avg_complexity",
            MetricName::AvgMaintainability => "avg_maintainability",
            MetricName::TotalIssues => "total_issues",
            MetricName::CommentRatio => "comment_ratio",
            MetricName::IssueDensity => "issue_density",
        }
    }

    pub fn value(&self, summary: &RunSummary) -> f64 {
        match self {
            MetricName::TotalFiles => summary.total_files as f64,
            MetricName::TotalLoc => summary.total_loc as f64,
            MetricName::AvgComplexity => summary.avg_complexity,
            MetricName::AvgMaintainability => summary.avg_maintainability,
            MetricName::TotalIssues => summary.total_issues as f64,
            MetricName::CommentRatio => summary.comment_ratio(),
            MetricName::IssueDensity => summary.issue_density(),
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = RepolensError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        MetricName::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| RepolensError::UnknownMetric(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub run_id: i64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Change between two consecutive runs of the same project. Positive
/// numbers mean the metric went up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDelta {
    pub from_run_id: i64,
    pub to_run_id: i64,
    pub elapsed_seconds: f64,
    pub total_files: i64,
    pub total_loc: i64,
    pub avg_complexity: f64,
    pub avg_maintainability: f64,
    pub total_issues: i64,
    pub comment_ratio: f64,
    pub issue_density: f64,
    pub languages_added: Vec<String>,
    pub languages_removed: Vec<String>,
}

fn signed_diff(prev: u64, next: u64) -> i64 {
    next as i64 - prev as i64
}

impl RunDelta {
    pub fn between(prev: &AnalysisRun, next: &AnalysisRun) -> RunDelta {
        let a = &prev.summary;
        let b = &next.summary;
        let elapsed = next.timestamp - prev.timestamp;
        RunDelta {
            from_run_id: prev.run_id,
            to_run_id: next.run_id,
            elapsed_seconds: elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6,
            total_files: signed_diff(a.total_files, b.total_files),
            total_loc: signed_diff(a.total_loc, b.total_loc),
            avg_complexity: b.avg_complexity - a.avg_complexity,
            avg_maintainability: b.avg_maintainability - a.avg_maintainability,
            total_issues: signed_diff(a.total_issues, b.total_issues),
            comment_ratio: b.comment_ratio() - a.comment_ratio(),
            issue_density: b.issue_density() - a.issue_density(),
            languages_added: b
                .language_breakdown
                .keys()
                .filter(|k| !a.language_breakdown.contains_key(*k))
                .cloned()
                .collect(),
            languages_removed: a
                .language_breakdown
                .keys()
                .filter(|k| !b.language_breakdown.contains_key(*k))
                .cloned()
                .collect(),
        }
    }

    /// Fewer issues per KLOC and no drop in maintainability.
    pub fn is_improvement(&self) -> bool {
        self.issue_density < 0.0 && self.avg_maintainability >= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn run(run_id: i64, secs: i64, loc: u64, issues: u64, langs: &[&str]) -> AnalysisRun {
        let language_breakdown: IndexMap<String, f64> =
            langs.iter().map(|l| (l.to_string(), 1.0)).collect();
        AnalysisRun {
            run_id,
            project_path: "/srv/app".into(),
            timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            summary: RunSummary {
                total_files: 10,
                total_loc: loc,
                avg_complexity: 4.0,
                avg_maintainability: 70.0,
                total_issues: issues,
                comment_lines: 0,
                language_breakdown,
            },
            issues: Vec::new(),
            report_digest: None,
        }
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!("avg_complexity".parse::<MetricName>().unwrap(), MetricName::AvgComplexity);
        assert_eq!(" Issue_Density ".parse::<MetricName>().unwrap(), MetricName::IssueDensity);
        assert!(matches!(
            "coverage".parse::<MetricName>(),
            Err(RepolensError::UnknownMetric(_))
        ));
    }

    #[test]
    fn delta_between_runs() {
        let prev = run(1, 0, 2000, 10, &["python", "web"]);
        let next = run(2, 90, 1000, 2, &["python", "rust"]);
        let delta = RunDelta::between(&prev, &next);
        assert_eq!(delta.total_loc, -1000);
        assert_eq!(delta.total_issues, -8);
        assert!((delta.issue_density - (-3.0)).abs() < 1e-12);
        assert_eq!(delta.elapsed_seconds, 90.0);
        assert_eq!(delta.languages_added, vec!["rust".to_string()]);
        assert_eq!(delta.languages_removed, vec!["web".to_string()]);
        assert!(delta.is_improvement());
    }
}
