//! End-to-end behaviour of the analyzer against an on-disk store.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;

use repolens_core::history::RunDraft;
use repolens_core::{
    Analyzer, EngineConfig, FeatureExtractor, IdentifierTokenizer, Issue, MetricReport,
    ProjectState, RepolensError, RunSummary, SimilarityIndex, Tokenizer,
};

fn open(dir: &tempfile::TempDir) -> Analyzer {
    Analyzer::open(EngineConfig::new(dir.path().join("repolens.db"))).unwrap()
}

fn report(loc: u64, cx: f64, maint: f64, lang: &str, share: f64) -> MetricReport {
    MetricReport::new(10, loc, cx, maint).with_language(lang, share)
}

#[test]
fn equal_reports_give_equal_fingerprints() {
    let extractor = FeatureExtractor::default();
    let build = || {
        report(4200, 6.5, 61.0, "typescript", 0.8)
            .with_language("css", 0.2)
            .with_corpus("export function renderWidgetTree(rootNode) { return walkTree(rootNode) }")
            .with_issue(Issue::new("complexity", "High cyclomatic complexity: 19"))
    };
    assert_eq!(
        extractor.extract(&build()).unwrap(),
        extractor.extract(&build()).unwrap()
    );
}

#[test]
fn structurally_close_project_ranks_first() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    analyzer.analyze("/p/a", &report(1000, 2.0, 90.0, "py", 0.9)).unwrap();
    analyzer.analyze("/p/b", &report(1200, 2.1, 88.0, "py", 0.92)).unwrap();
    analyzer.analyze("/p/c", &report(1000, 40.0, 20.0, "js", 1.0)).unwrap();

    let similar = analyzer.similar("/p/a").unwrap();
    assert_eq!(similar.len(), 2);
    assert_eq!(similar[0].project_path, "/p/b");
    assert_eq!(similar[1].project_path, "/p/c");
    assert!(similar[0].score > similar[1].score);
    assert!(similar.iter().all(|s| s.score.is_finite()));
}

#[test]
fn query_never_returns_self_or_more_than_k() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = Analyzer::open(
        EngineConfig::new(dir.path().join("repolens.db")).with_top_k(3),
    )
    .unwrap();
    for i in 0..8u64 {
        let outcome = analyzer
            .analyze(&format!("/p/{i}"), &report(500 + i * 250, 1.0 + i as f64, 80.0, "go", 1.0))
            .unwrap();
        assert!(outcome.similar_projects.len() <= 3);
        assert!(outcome
            .similar_projects
            .iter()
            .all(|s| s.project_path != format!("/p/{i}")));
    }
    let similar = analyzer.similar_with_limit("/p/0", 5).unwrap();
    assert_eq!(similar.len(), 5);
    assert!(similar.iter().all(|s| s.project_path != "/p/0"));
}

#[test]
fn pattern_surfaces_on_third_occurrence() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    let with_issue = |lines: u32| {
        report(2000, 3.0, 70.0, "java", 1.0)
            .with_issue(Issue::new("length", format!("File too long: {lines} lines")))
            .with_issue(Issue::new("length", format!("File too long: {} lines", lines + 110)))
    };

    let first = analyzer.analyze("/p/one", &with_issue(610)).unwrap();
    let second = analyzer.analyze("/p/two", &with_issue(720)).unwrap();
    assert!(first.suggestions.is_empty());
    assert!(second.suggestions.is_empty());
    let entry = analyzer
        .learner()
        .entry("length:file too long: <n> lines")
        .unwrap()
        .unwrap();
    assert_eq!(entry.occurrence_count, 2);

    let third = analyzer.analyze("/p/three", &with_issue(830)).unwrap();
    assert_eq!(third.suggestions.len(), 1);
    assert_eq!(third.suggestions[0].signature, "length:file too long: <n> lines");
    assert_eq!(third.suggestions[0].occurrence_count, 3);
}

#[test]
fn one_run_with_repeated_issue_is_not_a_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    let mut long_files = report(9000, 3.0, 70.0, "java", 1.0);
    for lines in [610, 720, 830] {
        long_files = long_files.with_issue(Issue::new("length", format!("File too long: {lines} lines")));
    }
    let outcome = analyzer.analyze("/p/monolith", &long_files).unwrap();
    assert!(outcome.suggestions.is_empty());
    let entry = analyzer
        .learner()
        .entry("length:file too long: <n> lines")
        .unwrap()
        .unwrap();
    assert_eq!(entry.occurrence_count, 1);
}

#[test]
fn sequential_records_build_ordered_history() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    for loc in [1000, 1100, 1200] {
        analyzer.analyze("/p/hist", &report(loc, 2.0, 80.0, "rust", 1.0)).unwrap();
    }
    let runs = analyzer.history("/p/hist").unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.windows(2).all(|w| w[0].run_id < w[1].run_id));
    assert!(runs.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let loc: Vec<f64> = analyzer
        .trend("/p/hist", "total_loc")
        .unwrap()
        .iter()
        .map(|p| p.value)
        .collect();
    assert_eq!(loc, vec![1000.0, 1100.0, 1200.0]);
}

#[test]
fn held_ticket_blocks_concurrent_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    let ticket = analyzer.history_manager().begin("/p/busy").unwrap();

    thread::scope(|s| {
        let handle = s.spawn(|| analyzer.analyze("/p/busy", &report(100, 1.0, 90.0, "go", 1.0)));
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, RepolensError::AnalysisInProgress(_)));
    });

    let summary = RunSummary::from_report(&report(100, 1.0, 90.0, "go", 1.0));
    let (run, ()) = ticket.commit(RunDraft::new(summary), |_, _| Ok(())).unwrap();
    let runs = analyzer.history("/p/busy").unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, run.run_id);
}

/// Tokenizer that parks on two barriers when it sees the word `hold`, so a
/// test can keep an analysis in flight.
struct GatedTokenizer {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
}

impl Tokenizer for GatedTokenizer {
    fn tokenize(&self, text: &str) -> BTreeMap<String, u64> {
        if text.contains("hold") {
            self.entered.wait();
            self.release.wait();
        }
        IdentifierTokenizer.tokenize(text)
    }
}

#[test]
fn overlapping_analyses_of_one_project_admit_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let gate = GatedTokenizer {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    };
    let analyzer = open(&dir).with_extractor(FeatureExtractor::with_tokenizer(Arc::new(gate), 256));
    let held = report(1000, 2.0, 80.0, "python", 1.0).with_corpus("hold parse_request");
    let competing = report(5000, 2.0, 80.0, "python", 1.0);

    let (first, second) = thread::scope(|s| {
        let first = s.spawn(|| analyzer.analyze("/p/race", &held));
        entered.wait();
        let second = analyzer.analyze("/p/race", &competing);
        release.wait();
        (first.join().unwrap(), second)
    });

    let first = first.unwrap();
    assert!(matches!(second, Err(RepolensError::AnalysisInProgress(_))));
    let runs = analyzer.history("/p/race").unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, first.run.run_id);
    assert_eq!(runs[0].summary, first.run.summary);
    assert_eq!(runs[0].summary.total_loc, 1000);
}

#[test]
fn distinct_projects_analyze_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    thread::scope(|s| {
        for i in 0..6u64 {
            let analyzer = &analyzer;
            s.spawn(move || {
                analyzer
                    .analyze(&format!("/p/par{i}"), &report(800 + i * 10, 2.0, 75.0, "rust", 1.0))
                    .unwrap();
            });
        }
    });
    assert_eq!(analyzer.projects().unwrap().len(), 6);
    assert_eq!(analyzer.index().len(), 6);
}

#[test]
fn new_fingerprint_is_visible_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    analyzer.analyze("/p/old", &report(1000, 2.0, 80.0, "go", 1.0)).unwrap();
    analyzer.analyze("/p/new", &report(1000, 2.5, 79.0, "go", 1.0)).unwrap();
    let similar = analyzer.similar("/p/old").unwrap();
    assert!(similar.iter().any(|s| s.project_path == "/p/new"));
}

#[test]
fn dropped_ticket_leaves_no_run() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    {
        let _ticket = analyzer.history_manager().begin("/p/abandoned").unwrap();
        assert_eq!(analyzer.state("/p/abandoned").unwrap(), ProjectState::Analyzing);
    }
    assert_eq!(analyzer.state("/p/abandoned").unwrap(), ProjectState::Unknown);
    assert!(matches!(
        analyzer.history("/p/abandoned"),
        Err(RepolensError::UnknownProject(_))
    ));
}

#[test]
fn reopen_skips_corrupted_fingerprints() {
    let dir = tempfile::tempdir().unwrap();
    {
        let analyzer = open(&dir);
        analyzer.analyze("/p/good", &report(1000, 2.0, 80.0, "go", 1.0)).unwrap();
        let bad = analyzer
            .analyze("/p/bad", &report(1000, 2.0, 80.0, "go", 1.0))
            .unwrap();
        analyzer
            .database()
            .connect()
            .unwrap()
            .execute(
                "UPDATE fingerprints SET vector = X'00010203' WHERE run_id = ?1;",
                [bad.run.run_id],
            )
            .unwrap();
    }

    let reopened = open(&dir);
    assert_eq!(reopened.index().len(), 1);
    assert!(reopened.similar("/p/bad").is_err());
    assert!(reopened.similar("/p/good").unwrap().is_empty());
    assert_eq!(reopened.history("/p/bad").unwrap().len(), 1);
}

#[test]
fn json_reports_are_validated_at_the_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let analyzer = open(&dir);
    let missing = serde_json::json!({"total_files": 3, "total_loc": 10});
    let err = analyzer.analyze_value("/p/json", &missing).unwrap_err();
    assert_eq!(err.kind(), repolens_core::ErrorKind::InvalidReport);
    assert!(analyzer.projects().unwrap().is_empty());

    let ok = serde_json::json!({
        "total_files": 3,
        "total_loc": 10,
        "avg_complexity": 1.0,
        "avg_maintainability": 99.0,
        "language_breakdown": {"rust": 10},
        "issues": ["Missing docs on `run`"]
    });
    let outcome = analyzer.analyze_value("/p/json", &ok).unwrap();
    assert_eq!(outcome.run.issues[0].category, "general");
    assert!(outcome.run.report_digest.is_some());
}
