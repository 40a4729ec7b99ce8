//! Process-wide recurring-pattern store.

use std::collections::VecDeque;

use chrono::{DateTime, SubsecRound, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{
    clamp_limit, DEFAULT_SAMPLE_CAPACITY, DEFAULT_SUGGESTION_THRESHOLD, MAX_SAMPLE_CAPACITY,
};
use crate::errors::RepolensResult;
use crate::learning::fixes::FixCatalog;
use crate::learning::signature::{issue_signature, normalize_category};
use crate::models::Issue;
use crate::store::database::{format_timestamp, parse_timestamp};
use crate::store::Database;

pub const MAX_TOP_PATTERNS: usize = 500;

/// Aggregate record of one issue signature across every analyzed project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningEntry {
    pub signature: String,
    pub category: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    /// Most recent raw messages, oldest first.
    pub samples: VecDeque<String>,
    pub suggested_fix: Option<String>,
}

impl LearningEntry {
    fn new(signature: String, category: String, seen_at: DateTime<Utc>) -> Self {
        Self {
            signature,
            category,
            first_seen: seen_at,
            last_seen: seen_at,
            occurrence_count: 0,
            samples: VecDeque::new(),
            suggested_fix: None,
        }
    }

    /// Count one more run carrying this signature.
    fn record_run(&mut self, seen_at: DateTime<Utc>) {
        self.occurrence_count += 1;
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }

    fn push_sample(&mut self, message: &str, capacity: usize) {
        while self.samples.len() >= capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(message.to_string());
    }
}

/// A recurring pattern surfaced by a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub signature: String,
    pub category: String,
    pub occurrence_count: u64,
    pub suggested_fix: String,
}

/// Which entries [`PatternLearner::prune`] removes: those rarer than
/// `min_occurrences` or last seen before `last_seen_before`. Unset criteria
/// match nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrunePolicy {
    pub min_occurrences: Option<u64>,
    pub last_seen_before: Option<DateTime<Utc>>,
}

impl PrunePolicy {
    pub fn below(min_occurrences: u64) -> Self {
        Self {
            min_occurrences: Some(min_occurrences),
            last_seen_before: None,
        }
    }

    pub fn older_than(cutoff: DateTime<Utc>) -> Self {
        Self {
            min_occurrences: None,
            last_seen_before: Some(cutoff),
        }
    }
}

// ---------------------------------------------------------------------------
// PatternLearner
// ---------------------------------------------------------------------------

/// Counts normalized issue signatures across all runs and flags the ones
/// that keep coming back.
///
/// Writes are serialized by an internal mutex. Callers that fold issues as
/// part of a larger transaction take a [`LearnerWriter`] first and hold it
/// until that transaction commits.
pub struct PatternLearner {
    db: Database,
    catalog: FixCatalog,
    threshold: u64,
    sample_capacity: usize,
    write_lock: Mutex<()>,
}

/// Exclusive write access to the learner.
pub struct LearnerWriter<'a> {
    learner: &'a PatternLearner,
    _guard: MutexGuard<'a, ()>,
}

impl PatternLearner {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            catalog: FixCatalog::default(),
            threshold: DEFAULT_SUGGESTION_THRESHOLD,
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_sample_capacity(mut self, capacity: usize) -> Self {
        self.sample_capacity = clamp_limit(capacity, MAX_SAMPLE_CAPACITY);
        self
    }

    pub fn with_catalog(mut self, catalog: FixCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn catalog(&self) -> &FixCatalog {
        &self.catalog
    }

    /// Block until no other fold is in progress.
    pub fn writer(&self) -> LearnerWriter<'_> {
        LearnerWriter {
            learner: self,
            _guard: self.write_lock.lock(),
        }
    }

    /// Fold one run's issues in a transaction of its own.
    pub fn observe(&self, issues: &[Issue]) -> RepolensResult<Vec<Suggestion>> {
        let writer = self.writer();
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let suggestions = writer.observe(&tx, issues, Utc::now())?;
        tx.commit()?;
        Ok(suggestions)
    }

    pub fn entry(&self, signature: &str) -> RepolensResult<Option<LearningEntry>> {
        let conn = self.db.connect()?;
        load_entry(&conn, signature)
    }

    /// Most frequent signatures, ties broken by signature.
    pub fn top_patterns(&self, limit: usize) -> RepolensResult<Vec<LearningEntry>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT signature, category, first_seen, last_seen, occurrence_count, \
                    samples_json, suggested_fix \
             FROM learning_entries \
             ORDER BY occurrence_count DESC, signature ASC LIMIT ?1;",
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit, MAX_TOP_PATTERNS) as i64], EntryRow::read)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Delete entries matching `policy`; returns how many were removed.
    pub fn prune(&self, policy: &PrunePolicy) -> RepolensResult<usize> {
        if policy.min_occurrences.is_none() && policy.last_seen_before.is_none() {
            return Ok(0);
        }
        let _writer = self.writer();
        let conn = self.db.connect()?;
        let removed = conn.execute(
            "DELETE FROM learning_entries \
             WHERE (?1 IS NOT NULL AND occurrence_count < ?1) \
                OR (?2 IS NOT NULL AND last_seen < ?2);",
            params![
                policy.min_occurrences.map(|n| n as i64),
                policy.last_seen_before.as_ref().map(format_timestamp),
            ],
        )?;
        info!(removed, "pruned learning entries");
        Ok(removed)
    }

    /// Forget every learned pattern.
    pub fn reset(&self) -> RepolensResult<usize> {
        let _writer = self.writer();
        let conn = self.db.connect()?;
        let removed = conn.execute("DELETE FROM learning_entries;", [])?;
        info!(removed, "reset learning entries");
        Ok(removed)
    }
}

impl LearnerWriter<'_> {
    /// Fold one run's `issues` into the store through `conn`, which is
    /// expected to be inside the caller's transaction. A signature counts
    /// once per run however many of its issues the run carries; every raw
    /// message still goes into the sample. Returns the touched entries that
    /// reached the suggestion threshold, most frequent first.
    pub fn observe(
        &self,
        conn: &Connection,
        issues: &[Issue],
        seen_at: DateTime<Utc>,
    ) -> RepolensResult<Vec<Suggestion>> {
        let learner = self.learner;
        let seen_at = seen_at.trunc_subsecs(6);

        let mut by_signature: IndexMap<String, Vec<&Issue>> = IndexMap::new();
        for issue in issues {
            by_signature.entry(issue_signature(issue)).or_default().push(issue);
        }

        for (signature, group) in &by_signature {
            let mut entry = match load_entry(conn, signature)? {
                Some(entry) => entry,
                None => LearningEntry::new(
                    signature.clone(),
                    normalize_category(&group[0].category),
                    seen_at,
                ),
            };
            entry.record_run(seen_at);
            for issue in group {
                entry.push_sample(&issue.message, learner.sample_capacity);
            }
            entry.suggested_fix = learner.catalog.lookup(signature).map(str::to_string);
            save_entry(conn, &entry)?;
        }

        let mut suggestions = Vec::new();
        for signature in by_signature.keys() {
            let Some(entry) = load_entry(conn, signature)? else {
                continue;
            };
            if entry.occurrence_count < learner.threshold {
                continue;
            }
            suggestions.push(Suggestion {
                suggested_fix: learner.catalog.suggest(signature).to_string(),
                signature: entry.signature,
                category: entry.category,
                occurrence_count: entry.occurrence_count,
            });
        }
        suggestions.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        debug!(
            issues = issues.len(),
            signatures = by_signature.len(),
            suggestions = suggestions.len(),
            "folded run issues"
        );
        Ok(suggestions)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

struct EntryRow {
    signature: String,
    category: String,
    first_seen: String,
    last_seen: String,
    occurrence_count: i64,
    samples_json: String,
    suggested_fix: Option<String>,
}

impl EntryRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            signature: row.get(0)?,
            category: row.get(1)?,
            first_seen: row.get(2)?,
            last_seen: row.get(3)?,
            occurrence_count: row.get(4)?,
            samples_json: row.get(5)?,
            suggested_fix: row.get(6)?,
        })
    }

    fn into_entry(self) -> RepolensResult<LearningEntry> {
        Ok(LearningEntry {
            signature: self.signature,
            category: self.category,
            first_seen: parse_timestamp(&self.first_seen)?,
            last_seen: parse_timestamp(&self.last_seen)?,
            occurrence_count: self.occurrence_count.max(0) as u64,
            samples: serde_json::from_str(&self.samples_json)?,
            suggested_fix: self.suggested_fix,
        })
    }
}

fn load_entry(conn: &Connection, signature: &str) -> RepolensResult<Option<LearningEntry>> {
    let raw = conn
        .query_row(
            "SELECT signature, category, first_seen, last_seen, occurrence_count, \
                    samples_json, suggested_fix \
             FROM learning_entries WHERE signature = ?1;",
            params![signature],
            EntryRow::read,
        )
        .optional()?;
    raw.map(EntryRow::into_entry).transpose()
}

fn save_entry(conn: &Connection, entry: &LearningEntry) -> RepolensResult<()> {
    conn.execute(
        "INSERT INTO learning_entries ( \
             signature, category, first_seen, last_seen, occurrence_count, \
             samples_json, suggested_fix \
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(signature) DO UPDATE SET \
             last_seen = excluded.last_seen, \
             occurrence_count = excluded.occurrence_count, \
             samples_json = excluded.samples_json, \
             suggested_fix = excluded.suggested_fix;",
        params![
            entry.signature,
            entry.category,
            format_timestamp(&entry.first_seen),
            format_timestamp(&entry.last_seen),
            entry.occurrence_count as i64,
            serde_json::to_string(&entry.samples)?,
            entry.suggested_fix,
        ],
    )?;
    Ok(())
}
