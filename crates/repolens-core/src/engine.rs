//! The downstream facade: one call records a run, learns from its issues
//! and reports similar projects.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{clamp_limit, EngineConfig, MAX_SIMILAR_RESULTS};
use crate::errors::{RepolensError, RepolensResult};
use crate::fingerprint::extractor::{feature_vector, FeatureExtractor};
use crate::fingerprint::{Fingerprint, FEATURE_DIMENSION, FEATURE_SCHEMA_VERSION};
use crate::history::{HistoryManager, MetricName, RunDelta, RunDraft, TrendPoint};
use crate::index::linear::LinearIndex;
use crate::index::{SimilarityHit, SimilarityIndex};
use crate::learning::{PatternLearner, PrunePolicy, Suggestion};
use crate::models::{canonical_project_path, AnalysisRun, MetricReport, Project, ProjectState, RunSummary};
use crate::store::database as db;
use crate::store::Database;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarProject {
    pub project_path: String,
    pub run_id: i64,
    pub score: f64,
}

impl From<SimilarityHit> for SimilarProject {
    fn from(hit: SimilarityHit) -> Self {
        Self {
            project_path: hit.project_path,
            run_id: hit.run_id,
            score: hit.score,
        }
    }
}

/// Result of [`Analyzer::analyze`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisOutcome {
    pub run: AnalysisRun,
    pub suggestions: Vec<Suggestion>,
    pub similar_projects: Vec<SimilarProject>,
    /// Change against the project's previous run, if it had one.
    pub delta: Option<RunDelta>,
}

/// Owns the store, the similarity index, the pattern learner and the
/// history manager, and keeps them consistent with each other.
pub struct Analyzer {
    config: EngineConfig,
    db: Database,
    extractor: FeatureExtractor,
    index: Box<dyn SimilarityIndex>,
    learner: PatternLearner,
    history: HistoryManager,
}

impl Analyzer {
    /// Open (or create) the store at `config.db_path` and load the latest
    /// fingerprint of every project into a [`LinearIndex`].
    pub fn open(config: EngineConfig) -> RepolensResult<Self> {
        let config = config.sanitized();
        let index = LinearIndex::new(config.vector_weight, config.token_weight);
        Self::open_with_index(config, Box::new(index))
    }

    /// Like [`Analyzer::open`] with a caller-supplied index implementation.
    pub fn open_with_index(
        config: EngineConfig,
        index: Box<dyn SimilarityIndex>,
    ) -> RepolensResult<Self> {
        if index.dimension() != FEATURE_DIMENSION || index.schema_version() != FEATURE_SCHEMA_VERSION {
            return Err(RepolensError::schema_mismatch(
                format!("v{FEATURE_SCHEMA_VERSION}/{FEATURE_DIMENSION}d"),
                format!("v{}/{}d", index.schema_version(), index.dimension()),
            ));
        }
        let config = config.sanitized();
        let db = Database::open(&config.db_path)?;
        let learner = PatternLearner::new(db.clone())
            .with_threshold(config.suggestion_threshold)
            .with_sample_capacity(config.sample_capacity);
        let analyzer = Self {
            extractor: FeatureExtractor::new(config.vocabulary_cap),
            history: HistoryManager::new(db.clone()),
            learner,
            index,
            db,
            config,
        };
        let loaded = analyzer.rebuild_index()?;
        info!(
            path = %analyzer.db.db_path().display(),
            fingerprints = loaded,
            "analyzer opened"
        );
        Ok(analyzer)
    }

    /// Replace the feature extractor, e.g. to plug in another tokenizer.
    pub fn with_extractor(mut self, extractor: FeatureExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn history_manager(&self) -> &HistoryManager {
        &self.history
    }

    pub fn learner(&self) -> &PatternLearner {
        &self.learner
    }

    pub fn index(&self) -> &dyn SimilarityIndex {
        self.index.as_ref()
    }

    /// Reload population statistics and the newest intact fingerprint of
    /// every project. Returns the number of fingerprints loaded.
    pub fn rebuild_index(&self) -> RepolensResult<usize> {
        let conn = self.db.connect()?;
        let population = db::load_population(&conn, FEATURE_SCHEMA_VERSION, FEATURE_DIMENSION)?;
        self.index.set_population(population);
        let stored = db::latest_fingerprints(&conn, FEATURE_SCHEMA_VERSION)?;
        let loaded = stored.len();
        for entry in stored {
            self.index
                .insert(&entry.project_path, entry.run_id, entry.fingerprint)?;
        }
        Ok(loaded)
    }

    // -----------------------------------------------------------------------
    // analyze
    // -----------------------------------------------------------------------

    /// Record `report` as a new run of `project_path`, fold its issues into
    /// the pattern store and rank similar projects.
    ///
    /// The report is validated before the project is claimed; tokenization
    /// runs while the claim is held. The run, its fingerprint, the
    /// population statistics and the learning entries commit together; the
    /// index sees the new fingerprint only after that commit, and before
    /// this call returns.
    pub fn analyze(&self, project_path: &str, report: &MetricReport) -> RepolensResult<AnalysisOutcome> {
        let path = canonical_project_path(project_path)?;
        report.validate()?;
        let draft = RunDraft {
            summary: RunSummary::from_report(report),
            issues: report.issues.clone(),
            report_digest: Some(report.digest()?),
        };

        let ticket = self.history.begin(&path)?;
        let fingerprint = self.extractor.extract(report)?;
        let previous = match self.history.latest(&path) {
            Ok(run) => Some(run),
            Err(RepolensError::UnknownProject(_)) => None,
            Err(e) => return Err(e),
        };

        let writer = self.learner.writer();
        let (run, (suggestions, population)) = ticket.commit(draft, |conn, run| {
            db::insert_fingerprint(conn, run.run_id, &fingerprint)?;
            let mut population =
                db::load_population(conn, FEATURE_SCHEMA_VERSION, FEATURE_DIMENSION)?;
            population.observe(&fingerprint.vector);
            db::save_population(conn, FEATURE_SCHEMA_VERSION, &population)?;
            let suggestions = writer.observe(conn, &run.issues, run.timestamp)?;
            Ok((suggestions, population))
        })?;

        self.index.set_population(population);
        self.index.insert(&path, run.run_id, fingerprint.clone())?;
        drop(writer);

        let similar_projects: Vec<SimilarProject> = self
            .index
            .query(&fingerprint, self.config.top_k, Some(&path))?
            .into_iter()
            .map(SimilarProject::from)
            .collect();
        let delta = previous.as_ref().map(|prev| RunDelta::between(prev, &run));

        info!(
            project = %path,
            run_id = run.run_id,
            issues = run.issues.len(),
            suggestions = suggestions.len(),
            similar = similar_projects.len(),
            "analysis complete"
        );
        Ok(AnalysisOutcome {
            run,
            suggestions,
            similar_projects,
            delta,
        })
    }

    /// [`Analyzer::analyze`] for a loosely-shaped JSON report.
    pub fn analyze_value(
        &self,
        project_path: &str,
        report: &serde_json::Value,
    ) -> RepolensResult<AnalysisOutcome> {
        let report = MetricReport::from_value(report)?;
        self.analyze(project_path, &report)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn history(&self, project_path: &str) -> RepolensResult<Vec<AnalysisRun>> {
        self.history.history(project_path)
    }

    pub fn trend(&self, project_path: &str, metric: &str) -> RepolensResult<Vec<TrendPoint>> {
        self.history.trend(project_path, metric)
    }

    pub fn trend_metrics(&self) -> &'static [MetricName] {
        &MetricName::ALL
    }

    pub fn state(&self, project_path: &str) -> RepolensResult<ProjectState> {
        self.history.state(project_path)
    }

    pub fn projects(&self) -> RepolensResult<Vec<Project>> {
        self.history.projects()
    }

    /// Projects most similar to `project_path`, using the configured top-k.
    /// The query vector is the project's newest fingerprinted run, so runs written
    /// through [`HistoryManager::record`] alone do not hide it.
    pub fn similar(&self, project_path: &str) -> RepolensResult<Vec<SimilarProject>> {
        self.similar_with_limit(project_path, self.config.top_k)
    }

    pub fn similar_with_limit(
        &self,
        project_path: &str,
        limit: usize,
    ) -> RepolensResult<Vec<SimilarProject>> {
        let latest = self.history.latest(project_path)?;
        let fingerprint = match self.index.candidate(&latest.project_path) {
            Some((_, fingerprint)) => fingerprint,
            None => {
                let conn = self.db.connect()?;
                db::load_fingerprint(&conn, latest.run_id, FEATURE_SCHEMA_VERSION)?
                    .filter(Fingerprint::is_current)
                    .ok_or_else(|| {
                        RepolensError::Storage(format!(
                            "no current fingerprint for {}; run refingerprint",
                            latest.project_path
                        ))
                    })?
            }
        };
        let hits = self.index.query(
            &fingerprint,
            clamp_limit(limit, MAX_SIMILAR_RESULTS),
            Some(&latest.project_path),
        )?;
        Ok(hits.into_iter().map(SimilarProject::from).collect())
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    pub fn prune_patterns(&self, policy: &PrunePolicy) -> RepolensResult<usize> {
        self.learner.prune(policy)
    }

    /// Derive current-schema fingerprints for runs that only have older ones,
    /// from their stored summaries and token summaries. Old rows are kept.
    /// Returns the number of runs re-fingerprinted.
    pub fn refingerprint(&self) -> RepolensResult<usize> {
        let _writer = self.learner.writer();
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let stale = db::runs_without_fingerprint(&tx, FEATURE_SCHEMA_VERSION)?;
        if stale.is_empty() {
            return Ok(0);
        }
        let rebuilt: Vec<(i64, Fingerprint)> = stale
            .par_iter()
            .map(|run| {
                (
                    run.run_id,
                    Fingerprint {
                        schema_version: FEATURE_SCHEMA_VERSION,
                        vector: feature_vector(&run.summary),
                        tokens: run.tokens.clone(),
                    },
                )
            })
            .collect();

        let mut population = db::load_population(&tx, FEATURE_SCHEMA_VERSION, FEATURE_DIMENSION)?;
        for (run_id, fingerprint) in &rebuilt {
            db::insert_fingerprint(&tx, *run_id, fingerprint)?;
            population.observe(&fingerprint.vector);
        }
        db::save_population(&tx, FEATURE_SCHEMA_VERSION, &population)?;
        tx.commit()?;

        let loaded = self.rebuild_index()?;
        if loaded == 0 {
            warn!("re-fingerprinting produced no usable fingerprints");
        }
        info!(runs = rebuilt.len(), "re-fingerprinted runs");
        Ok(rebuilt.len())
    }

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> RepolensResult<PathBuf> {
        self.db.backup_to(destination)
    }
}
