//! SQLite schema DDL and migration framework.
//!
//! Every table is created with `IF NOT EXISTS` so the statements replay
//! safely on an initialised database; structural changes after the baseline
//! go through numbered migration steps.

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::errors::{RepolensError, RepolensResult};
use crate::store::database::{get_meta, set_meta};

/// Version of the newest migration step.
pub const SCHEMA_VERSION: i32 = MIGRATIONS[MIGRATIONS.len() - 1].version;

/// Core DDL statements: 7 CREATE TABLE + 4 CREATE INDEX.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (7) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_analyzed_at TEXT
    );",
    "CREATE TABLE IF NOT EXISTS analysis_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id),
        timestamp TEXT NOT NULL,
        total_files INTEGER NOT NULL,
        total_loc INTEGER NOT NULL,
        avg_complexity REAL NOT NULL,
        avg_maintainability REAL NOT NULL,
        total_issues INTEGER NOT NULL,
        comment_lines INTEGER NOT NULL DEFAULT 0,
        language_json TEXT NOT NULL,
        issues_json TEXT NOT NULL,
        report_digest TEXT
    );",
    "CREATE TABLE IF NOT EXISTS fingerprints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL REFERENCES analysis_runs(id),
        schema_version INTEGER NOT NULL,
        dimension INTEGER NOT NULL,
        vector BLOB NOT NULL,
        checksum INTEGER NOT NULL,
        tokens_json TEXT NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(run_id, schema_version)
    );",
    "CREATE TABLE IF NOT EXISTS population_stats (
        schema_version INTEGER PRIMARY KEY,
        sample_count INTEGER NOT NULL,
        mean_json TEXT NOT NULL,
        m2_json TEXT NOT NULL,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS learning_entries (
        signature TEXT PRIMARY KEY,
        category TEXT NOT NULL,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        occurrence_count INTEGER NOT NULL DEFAULT 0,
        samples_json TEXT NOT NULL DEFAULT '[]',
        suggested_fix TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        description TEXT,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (4) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_runs_project ON analysis_runs(project_id, id);",
    "CREATE INDEX IF NOT EXISTS idx_runs_project_time ON analysis_runs(project_id, timestamp);",
    "CREATE INDEX IF NOT EXISTS idx_fingerprints_version_run ON fingerprints(schema_version, run_id);",
    "CREATE INDEX IF NOT EXISTS idx_learning_count ON learning_entries(occurrence_count DESC, signature);",
];

// ─── Migrations ─────────────────────────────────────────────────────────────

const VERSION_KEY: &str = "schema_version";

/// One numbered schema change, applied on top of the previous version.
struct Migration {
    version: i32,
    description: &'static str,
    apply: fn(&Connection) -> RepolensResult<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "baseline tables",
        apply: baseline,
    },
    Migration {
        version: 2,
        description: "index learning_entries.last_seen for age-based pruning",
        apply: index_learning_last_seen,
    },
];

/// Bring the store up to [`SCHEMA_VERSION`]. Each pending step runs in its
/// own SAVEPOINT; a failing step is rolled back, logged to
/// `migration_history` and returned, leaving earlier steps applied.
pub fn migrate_schema(conn: &Connection) -> RepolensResult<()> {
    let stored = get_schema_version(conn)?;
    for step in MIGRATIONS.iter().filter(|m| m.version > stored) {
        conn.execute_batch("SAVEPOINT repolens_migrate_step;")?;
        match apply_step(conn, step) {
            Ok(()) => {
                conn.execute_batch("RELEASE SAVEPOINT repolens_migrate_step;")?;
                debug!(version = step.version, step = step.description, "schema step applied");
            }
            Err(e) => {
                conn.execute_batch(
                    "ROLLBACK TO SAVEPOINT repolens_migrate_step; \
                     RELEASE SAVEPOINT repolens_migrate_step;",
                )?;
                warn!(version = step.version, error = %e, "schema step failed");
                log_step(conn, step, Some(&e.to_string()))?;
                return Err(e);
            }
        }
    }
    Ok(())
}

fn apply_step(conn: &Connection, step: &Migration) -> RepolensResult<()> {
    (step.apply)(conn)?;
    set_meta(conn, VERSION_KEY, &step.version.to_string())?;
    log_step(conn, step, None)
}

/// Version recorded in `store_meta`; 0 for a store that was never migrated.
pub fn get_schema_version(conn: &Connection) -> RepolensResult<i32> {
    match get_meta(conn, VERSION_KEY)? {
        None => Ok(0),
        Some(raw) => raw.parse::<i32>().map_err(|_| {
            RepolensError::Storage(format!("unreadable schema version {raw:?}"))
        }),
    }
}

fn log_step(conn: &Connection, step: &Migration, error: Option<&str>) -> RepolensResult<()> {
    conn.execute(
        "INSERT INTO migration_history \
             (from_version, to_version, status, description, error_message) \
         VALUES (?1, ?2, ?3, ?4, ?5);",
        params![
            step.version - 1,
            step.version,
            if error.is_some() { "failed" } else { "success" },
            step.description,
            error,
        ],
    )?;
    Ok(())
}

fn baseline(_conn: &Connection) -> RepolensResult<()> {
    Ok(())
}

fn index_learning_last_seen(conn: &Connection) -> RepolensResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_learning_last_seen \
         ON learning_entries(last_seen);",
    )?;
    Ok(())
}
