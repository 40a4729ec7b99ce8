//! Append-only analysis history per project.
//!
//! Runs are written through an [`AnalysisTicket`], which doubles as the
//! per-project in-flight guard: only one ticket per project can exist at a
//! time, and everything a ticket commits lands in a single `BEGIN IMMEDIATE`
//! transaction.

pub mod trend;

use std::collections::HashSet;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::errors::{RepolensError, RepolensResult};
use crate::models::{canonical_project_path, AnalysisRun, Issue, Project, ProjectState, RunSummary};
use crate::store::database::{self as db, Database};

pub use trend::{MetricName, RunDelta, TrendPoint};

/// Everything needed to write one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDraft {
    pub summary: RunSummary,
    pub issues: Vec<Issue>,
    pub report_digest: Option<String>,
}

impl RunDraft {
    pub fn new(summary: RunSummary) -> Self {
        Self {
            summary,
            issues: Vec::new(),
            report_digest: None,
        }
    }
}

/// Next run timestamp: now, but never at or before the previous run.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match previous {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

// ---------------------------------------------------------------------------
// HistoryManager
// ---------------------------------------------------------------------------

/// Only in-flight analyses are tracked in memory; settled states are read
/// back from the `projects` table.
pub struct HistoryManager {
    db: Database,
    in_flight: Mutex<HashSet<String>>,
}

impl HistoryManager {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Claim `project_path` for one analysis. Fails with
    /// `AnalysisInProgress` while another ticket for the same project is
    /// alive.
    pub fn begin(&self, project_path: &str) -> RepolensResult<AnalysisTicket<'_>> {
        let path = canonical_project_path(project_path)?;
        if !self.in_flight.lock().insert(path.clone()) {
            return Err(RepolensError::AnalysisInProgress(path));
        }
        debug!(project = %path, "analysis started");
        Ok(AnalysisTicket {
            manager: self,
            project_path: path,
            committed: false,
        })
    }

    /// Record a bare summary as a new run.
    pub fn record(&self, project_path: &str, summary: RunSummary) -> RepolensResult<AnalysisRun> {
        let ticket = self.begin(project_path)?;
        let (run, ()) = ticket.commit(RunDraft::new(summary), |_, _| Ok(()))?;
        Ok(run)
    }

    /// All runs of a project, oldest first.
    pub fn history(&self, project_path: &str) -> RepolensResult<Vec<AnalysisRun>> {
        let path = canonical_project_path(project_path)?;
        let conn = self.db.connect()?;
        let runs = db::runs_for_project(&conn, &path)?;
        if runs.is_empty() {
            return Err(RepolensError::UnknownProject(path));
        }
        Ok(runs)
    }

    pub fn trend(&self, project_path: &str, metric: &str) -> RepolensResult<Vec<TrendPoint>> {
        let metric: MetricName = metric.parse()?;
        Ok(self
            .history(project_path)?
            .iter()
            .map(|run| TrendPoint {
                run_id: run.run_id,
                timestamp: run.timestamp,
                value: metric.value(&run.summary),
            })
            .collect())
    }

    pub fn latest(&self, project_path: &str) -> RepolensResult<AnalysisRun> {
        let path = canonical_project_path(project_path)?;
        let conn = self.db.connect()?;
        db::latest_run(&conn, &path)?.ok_or(RepolensError::UnknownProject(path))
    }

    /// Deltas between each pair of consecutive runs, oldest first.
    pub fn deltas(&self, project_path: &str) -> RepolensResult<Vec<RunDelta>> {
        let runs = self.history(project_path)?;
        Ok(runs
            .windows(2)
            .map(|pair| RunDelta::between(&pair[0], &pair[1]))
            .collect())
    }

    pub fn state(&self, project_path: &str) -> RepolensResult<ProjectState> {
        let path = canonical_project_path(project_path)?;
        if self.in_flight.lock().contains(&path) {
            return Ok(ProjectState::Analyzing);
        }
        self.stored_state(&path)
    }

    pub fn projects(&self) -> RepolensResult<Vec<Project>> {
        let conn = self.db.connect()?;
        db::list_projects(&conn)
    }

    fn stored_state(&self, path: &str) -> RepolensResult<ProjectState> {
        let conn = self.db.connect()?;
        Ok(match db::find_project(&conn, path)? {
            Some(project) if project.last_analyzed_at.is_some() => ProjectState::Analyzed,
            _ => ProjectState::Unknown,
        })
    }

    /// Number of analyses currently holding a ticket.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn release(&self, path: &str) {
        self.in_flight.lock().remove(path);
    }
}

// ---------------------------------------------------------------------------
// AnalysisTicket
// ---------------------------------------------------------------------------

/// In-flight analysis of one project. Dropping it without a successful
/// [`commit`](AnalysisTicket::commit) writes nothing, so the project falls
/// back to whatever state its stored runs imply.
pub struct AnalysisTicket<'a> {
    manager: &'a HistoryManager,
    project_path: String,
    committed: bool,
}

impl std::fmt::Debug for AnalysisTicket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisTicket")
            .field("project_path", &self.project_path)
            .field("committed", &self.committed)
            .finish()
    }
}

impl AnalysisTicket<'_> {
    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    /// Write the run, then run `within` on the same transaction so callers
    /// can persist data that must commit or roll back together with it.
    pub fn commit<T, F>(mut self, draft: RunDraft, within: F) -> RepolensResult<(AnalysisRun, T)>
    where
        F: FnOnce(&Connection, &AnalysisRun) -> RepolensResult<T>,
    {
        let mut conn = self.manager.db.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let project_id = db::upsert_project(&tx, &self.project_path, &Utc::now())?;
        let timestamp = next_timestamp(db::last_run_timestamp(&tx, project_id)?);
        let run_id = db::insert_run(
            &tx,
            project_id,
            &timestamp,
            &draft.summary,
            &draft.issues,
            draft.report_digest.as_deref(),
        )?;
        db::touch_project(&tx, project_id, &timestamp)?;

        let run = AnalysisRun {
            run_id,
            project_path: self.project_path.clone(),
            timestamp,
            summary: draft.summary,
            issues: draft.issues,
            report_digest: draft.report_digest,
        };
        let extra = within(&tx, &run)?;
        tx.commit()?;

        self.committed = true;
        info!(project = %self.project_path, run_id, "analysis run recorded");
        Ok((run, extra))
    }
}

impl Drop for AnalysisTicket<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(project = %self.project_path, "analysis abandoned");
        }
        self.manager.release(&self.project_path);
    }
}
