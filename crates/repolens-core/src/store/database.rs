//! SQLite storage layer: projects, analysis runs, fingerprints and
//! population statistics.
//!
//! [`Database`] opens a fresh connection per unit of work. The free
//! functions take a `&Connection` so callers can compose several of them
//! inside one transaction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::config::BUSY_TIMEOUT_MS;
use crate::errors::{RepolensError, RepolensResult};
use crate::fingerprint::stats::PopulationStats;
use crate::fingerprint::Fingerprint;
use crate::models::{expand_tilde, project_display_name, AnalysisRun, Issue, Project, RunSummary};
use crate::store::schema;

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// RFC 3339 with microsecond precision and a `Z` suffix. Fixed width, so
/// lexical order matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> RepolensResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepolensError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Handle on the on-disk analysis store.
#[derive(Debug, Clone)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Resolve `db_path` (tilde-expanded, absolutized), create parent
    /// directories and bring the schema up to date.
    pub fn open(db_path: impl AsRef<Path>) -> RepolensResult<Self> {
        let expanded = expand_tilde(&db_path.as_ref().to_string_lossy());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()
                .map_err(|e| RepolensError::Storage(e.to_string()))?
                .join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RepolensError::Storage(e.to_string()))?;
        }
        let db = Self { db_path: resolved };
        db.init_schema()?;
        Ok(db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Open a new connection with foreign keys on and a busy timeout so
    /// concurrent writers queue instead of failing.
    pub fn connect(&self) -> RepolensResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(conn)
    }

    /// Set WAL mode, create all tables and indexes, then run pending
    /// migrations.
    pub fn init_schema(&self) -> RepolensResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        debug!(path = %self.db_path.display(), "analysis store ready");
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> RepolensResult<Option<String>> {
        let conn = self.connect()?;
        get_meta(&conn, key)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> RepolensResult<()> {
        let conn = self.connect()?;
        set_meta(&conn, key, value)
    }

    /// Copy the whole store to `destination` with the SQLite online backup
    /// API.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> RepolensResult<PathBuf> {
        let target = expand_tilde(&destination.as_ref().to_string_lossy());
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RepolensError::Storage(e.to_string()))?;
            }
        }
        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&target)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, Duration::from_millis(10), None)?;
        Ok(target)
    }
}

// ---------------------------------------------------------------------------
// store_meta
// ---------------------------------------------------------------------------

pub fn get_meta(conn: &Connection, key: &str) -> RepolensResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1 LIMIT 1;",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> RepolensResult<()> {
    conn.execute(
        "INSERT INTO store_meta(key, value) VALUES(?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

/// Create the project row if missing and return its id.
pub fn upsert_project(conn: &Connection, path: &str, now: &DateTime<Utc>) -> RepolensResult<i64> {
    conn.execute(
        "INSERT INTO projects(path, name, created_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(path) DO NOTHING;",
        params![path, project_display_name(path), format_timestamp(now)],
    )?;
    let id = conn.query_row(
        "SELECT id FROM projects WHERE path = ?1;",
        params![path],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn touch_project(conn: &Connection, project_id: i64, ts: &DateTime<Utc>) -> RepolensResult<()> {
    conn.execute(
        "UPDATE projects SET last_analyzed_at = ?1 WHERE id = ?2;",
        params![format_timestamp(ts), project_id],
    )?;
    Ok(())
}

type ProjectRow = (i64, String, String, String, Option<String>);

fn project_from_row(raw: ProjectRow) -> RepolensResult<Project> {
    let (id, path, name, created_at, last_analyzed_at) = raw;
    Ok(Project {
        id,
        path,
        name,
        created_at: parse_timestamp(&created_at)?,
        last_analyzed_at: last_analyzed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn read_project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

pub fn find_project(conn: &Connection, path: &str) -> RepolensResult<Option<Project>> {
    let raw = conn
        .query_row(
            "SELECT id, path, name, created_at, last_analyzed_at FROM projects WHERE path = ?1;",
            params![path],
            read_project_row,
        )
        .optional()?;
    raw.map(project_from_row).transpose()
}

pub fn list_projects(conn: &Connection) -> RepolensResult<Vec<Project>> {
    let mut stmt = conn.prepare(
        "SELECT id, path, name, created_at, last_analyzed_at FROM projects ORDER BY path ASC;",
    )?;
    let rows = stmt.query_map([], read_project_row)?;
    let mut projects = Vec::new();
    for row in rows {
        projects.push(project_from_row(row?)?);
    }
    Ok(projects)
}

// ---------------------------------------------------------------------------
// Analysis runs
// ---------------------------------------------------------------------------

const RUN_COLUMNS: &str = "r.id, p.path, r.timestamp, r.total_files, r.total_loc, \
     r.avg_complexity, r.avg_maintainability, r.total_issues, r.comment_lines, \
     r.language_json, r.issues_json, r.report_digest";

struct RunRow {
    run_id: i64,
    project_path: String,
    timestamp: String,
    total_files: i64,
    total_loc: i64,
    avg_complexity: f64,
    avg_maintainability: f64,
    total_issues: i64,
    comment_lines: i64,
    language_json: String,
    issues_json: String,
    report_digest: Option<String>,
}

impl RunRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            project_path: row.get(1)?,
            timestamp: row.get(2)?,
            total_files: row.get(3)?,
            total_loc: row.get(4)?,
            avg_complexity: row.get(5)?,
            avg_maintainability: row.get(6)?,
            total_issues: row.get(7)?,
            comment_lines: row.get(8)?,
            language_json: row.get(9)?,
            issues_json: row.get(10)?,
            report_digest: row.get(11)?,
        })
    }

    fn into_run(self) -> RepolensResult<AnalysisRun> {
        let language_breakdown: IndexMap<String, f64> = serde_json::from_str(&self.language_json)?;
        let issues: Vec<Issue> = serde_json::from_str(&self.issues_json)?;
        Ok(AnalysisRun {
            run_id: self.run_id,
            project_path: self.project_path,
            timestamp: parse_timestamp(&self.timestamp)?,
            summary: RunSummary {
                total_files: non_negative(self.total_files),
                total_loc: non_negative(self.total_loc),
                avg_complexity: self.avg_complexity,
                avg_maintainability: self.avg_maintainability,
                total_issues: non_negative(self.total_issues),
                comment_lines: non_negative(self.comment_lines),
                language_breakdown,
            },
            issues,
            report_digest: self.report_digest,
        })
    }
}

/// Timestamp of the project's most recent run, if any.
pub fn last_run_timestamp(conn: &Connection, project_id: i64) -> RepolensResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT timestamp FROM analysis_runs WHERE project_id = ?1 \
             ORDER BY id DESC LIMIT 1;",
            params![project_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_timestamp).transpose()
}

/// Append one immutable run row and return its run id.
pub fn insert_run(
    conn: &Connection,
    project_id: i64,
    timestamp: &DateTime<Utc>,
    summary: &RunSummary,
    issues: &[Issue],
    report_digest: Option<&str>,
) -> RepolensResult<i64> {
    conn.execute(
        "INSERT INTO analysis_runs ( \
             project_id, timestamp, total_files, total_loc, avg_complexity, \
             avg_maintainability, total_issues, comment_lines, language_json, \
             issues_json, report_digest \
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
        params![
            project_id,
            format_timestamp(timestamp),
            summary.total_files as i64,
            summary.total_loc as i64,
            summary.avg_complexity,
            summary.avg_maintainability,
            summary.total_issues as i64,
            summary.comment_lines as i64,
            serde_json::to_string(&summary.language_breakdown)?,
            serde_json::to_string(issues)?,
            report_digest,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// All runs of a project, oldest first.
pub fn runs_for_project(conn: &Connection, project_path: &str) -> RepolensResult<Vec<AnalysisRun>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM analysis_runs r \
         JOIN projects p ON p.id = r.project_id \
         WHERE p.path = ?1 ORDER BY r.id ASC;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![project_path], RunRow::read)?;
    let mut runs = Vec::new();
    for row in rows {
        runs.push(row?.into_run()?);
    }
    Ok(runs)
}

pub fn latest_run(conn: &Connection, project_path: &str) -> RepolensResult<Option<AnalysisRun>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM analysis_runs r \
         JOIN projects p ON p.id = r.project_id \
         WHERE p.path = ?1 ORDER BY r.id DESC LIMIT 1;"
    );
    let raw = conn.query_row(&sql, params![project_path], RunRow::read).optional()?;
    raw.map(RunRow::into_run).transpose()
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Latest decodable fingerprint of one project, as loaded for the index.
#[derive(Debug, Clone)]
pub struct StoredFingerprint {
    pub project_path: String,
    pub run_id: i64,
    pub fingerprint: Fingerprint,
}

/// A run with no fingerprint under the current feature schema, plus the
/// token summary carried by its newest older fingerprint.
#[derive(Debug, Clone)]
pub struct StaleRun {
    pub run_id: i64,
    pub summary: RunSummary,
    pub tokens: BTreeMap<String, f64>,
}

pub fn insert_fingerprint(conn: &Connection, run_id: i64, fingerprint: &Fingerprint) -> RepolensResult<()> {
    conn.execute(
        "INSERT INTO fingerprints (run_id, schema_version, dimension, vector, checksum, tokens_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![
            run_id,
            fingerprint.schema_version,
            fingerprint.dimension() as i64,
            fingerprint.vector_bytes(),
            fingerprint.checksum() as i64,
            serde_json::to_string(&fingerprint.tokens)?,
        ],
    )?;
    Ok(())
}

fn decode_fingerprint(
    schema_version: u32,
    dimension: i64,
    vector: &[u8],
    checksum: i64,
    tokens_json: &str,
) -> RepolensResult<Fingerprint> {
    let checksum = u32::try_from(checksum)
        .map_err(|_| RepolensError::Storage(format!("checksum {checksum} out of range")))?;
    let decoded = Fingerprint::decode_vector(vector, checksum)?;
    if decoded.len() as i64 != dimension {
        return Err(RepolensError::Storage(format!(
            "fingerprint declares dimension {dimension}, vector has {}",
            decoded.len()
        )));
    }
    Ok(Fingerprint {
        schema_version,
        vector: decoded,
        tokens: serde_json::from_str(tokens_json)?,
    })
}

/// Fingerprint of `run_id` under `schema_version`, if one was stored.
pub fn load_fingerprint(
    conn: &Connection,
    run_id: i64,
    schema_version: u32,
) -> RepolensResult<Option<Fingerprint>> {
    let raw: Option<(i64, Vec<u8>, i64, String)> = conn
        .query_row(
            "SELECT dimension, vector, checksum, tokens_json FROM fingerprints \
             WHERE run_id = ?1 AND schema_version = ?2;",
            params![run_id, schema_version],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    raw.map(|(dimension, vector, checksum, tokens)| {
        decode_fingerprint(schema_version, dimension, &vector, checksum, &tokens)
    })
    .transpose()
}

/// Newest intact fingerprint per project for `schema_version`. Rows that
/// fail their checksum or do not decode are skipped with a warning, falling
/// back to the project's previous run.
pub fn latest_fingerprints(
    conn: &Connection,
    schema_version: u32,
) -> RepolensResult<Vec<StoredFingerprint>> {
    let mut stmt = conn.prepare(
        "SELECT p.path, f.run_id, f.dimension, f.vector, f.checksum, f.tokens_json \
         FROM fingerprints f \
         JOIN analysis_runs r ON r.id = f.run_id \
         JOIN projects p ON p.id = r.project_id \
         WHERE f.schema_version = ?1 \
         ORDER BY p.path ASC, f.run_id DESC;",
    )?;
    let rows = stmt.query_map(params![schema_version], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut out: Vec<StoredFingerprint> = Vec::new();
    for row in rows {
        let (project_path, run_id, dimension, vector, checksum, tokens) = row?;
        if out.last().is_some_and(|prev| prev.project_path == project_path) {
            continue;
        }
        match decode_fingerprint(schema_version, dimension, &vector, checksum, &tokens) {
            Ok(fingerprint) => out.push(StoredFingerprint {
                project_path,
                run_id,
                fingerprint,
            }),
            Err(e) => warn!(project = %project_path, run_id, error = %e, "skipping corrupt fingerprint"),
        }
    }
    Ok(out)
}

/// Runs lacking a fingerprint for `schema_version`, oldest first.
pub fn runs_without_fingerprint(
    conn: &Connection,
    schema_version: u32,
) -> RepolensResult<Vec<StaleRun>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS}, \
             (SELECT f.tokens_json FROM fingerprints f WHERE f.run_id = r.id \
              ORDER BY f.schema_version DESC LIMIT 1) \
         FROM analysis_runs r \
         JOIN projects p ON p.id = r.project_id \
         WHERE NOT EXISTS ( \
             SELECT 1 FROM fingerprints f \
             WHERE f.run_id = r.id AND f.schema_version = ?1 \
         ) \
         ORDER BY r.id ASC;"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![schema_version], |row| {
        Ok((RunRow::read(row)?, row.get::<_, Option<String>>(12)?))
    })?;
    let mut stale = Vec::new();
    for row in rows {
        let (raw, tokens_json) = row?;
        let run = raw.into_run()?;
        let tokens = match tokens_json {
            Some(json) => serde_json::from_str(&json)?,
            None => BTreeMap::new(),
        };
        stale.push(StaleRun {
            run_id: run.run_id,
            summary: run.summary,
            tokens,
        });
    }
    Ok(stale)
}

// ---------------------------------------------------------------------------
// Population statistics
// ---------------------------------------------------------------------------

/// Stored statistics for `schema_version`, or empty statistics when none
/// exist or the stored dimension disagrees.
pub fn load_population(
    conn: &Connection,
    schema_version: u32,
    dimension: usize,
) -> RepolensResult<PopulationStats> {
    let raw: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT sample_count, mean_json, m2_json FROM population_stats \
             WHERE schema_version = ?1;",
            params![schema_version],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((count, mean_json, m2_json)) = raw else {
        return Ok(PopulationStats::new(dimension));
    };
    let stats = PopulationStats {
        count: non_negative(count),
        mean: serde_json::from_str(&mean_json)?,
        m2: serde_json::from_str(&m2_json)?,
    };
    if stats.mean.len() != dimension || stats.m2.len() != dimension {
        warn!(schema_version, "population stats dimension mismatch; starting fresh");
        return Ok(PopulationStats::new(dimension));
    }
    Ok(stats)
}

pub fn save_population(
    conn: &Connection,
    schema_version: u32,
    stats: &PopulationStats,
) -> RepolensResult<()> {
    conn.execute(
        "INSERT INTO population_stats(schema_version, sample_count, mean_json, m2_json) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(schema_version) DO UPDATE SET \
             sample_count = excluded.sample_count, \
             mean_json = excluded.mean_json, \
             m2_json = excluded.m2_json, \
             updated_at = CURRENT_TIMESTAMP;",
        params![
            schema_version,
            stats.count as i64,
            serde_json::to_string(&stats.mean)?,
            serde_json::to_string(&stats.m2)?,
        ],
    )?;
    Ok(())
}
