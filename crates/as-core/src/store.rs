use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::plan::FeaturePlan;
use crate::types::{
    AgentRole, AgentSession, Convoy, ConvoyStatus, Event, EventStatus, Feature, FeatureStatus,
    Priority, SessionStatus, StatusSnapshot, Task, TaskStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The row no longer matched the expected state at commit time.
    #[error("claim lost on {entity} {id}: no longer {expected}")]
    ClaimLost {
        entity: &'static str,
        id: String,
        expected: String,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("feature {0} cannot start while another feature is in progress")]
    FeatureBusy(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

impl StoreError {
    pub fn is_claim_lost(&self) -> bool {
        matches!(self, StoreError::ClaimLost { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable state shared by every worker: features, convoys, tasks, events
/// and agent sessions on one SQLite database.
///
/// Every state change that more than one caller may attempt goes through a
/// conditional update (`... WHERE id = ? AND status = ?`) inside an
/// immediate transaction; losing callers get [`StoreError::ClaimLost`].
#[derive(Clone)]
pub struct StateDb {
    conn: Connection,
}

/// Outcome of a conditional update, mapped to a `StoreResult` outside the
/// connection thread.
enum Cas<T> {
    Applied(T),
    Lost,
    Missing,
    Busy,
}

impl<T> Cas<T> {
    fn settle(self, entity: &'static str, id: impl ToString, expected: impl ToString) -> StoreResult<T> {
        match self {
            Cas::Applied(v) => Ok(v),
            Cas::Lost => Err(StoreError::ClaimLost {
                entity,
                id: id.to_string(),
                expected: expected.to_string(),
            }),
            Cas::Missing => Err(StoreError::NotFound {
                entity,
                id: id.to_string(),
            }),
            Cas::Busy => Err(StoreError::FeatureBusy(id.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// helpers – encoding
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so lexical order in SQL matches time order.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Enums stored as their snake_case label.
trait SqlLabel {
    fn label(&self) -> &'static str;
}

macro_rules! sql_label {
    ($($ty:ty),* $(,)?) => {
        $(impl SqlLabel for $ty {
            fn label(&self) -> &'static str {
                self.as_str()
            }
        })*
    };
}

sql_label!(
    FeatureStatus,
    Priority,
    ConvoyStatus,
    TaskStatus,
    EventStatus,
    AgentRole,
    SessionStatus,
);

fn enum_to_sql<T: SqlLabel>(val: &T) -> String {
    val.label().to_string()
}

fn to_json<T: Serialize>(val: &T) -> StoreResult<String> {
    serde_json::to_string(val).map_err(|e| StoreError::Corrupt(e.to_string()))
}

// ---------------------------------------------------------------------------
// helpers – decoding
// ---------------------------------------------------------------------------

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn col_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion(idx, e))
}

fn col_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion(idx, e)))
        .transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn col_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn col_enum<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(raw)).map_err(|e| conversion(idx, e))
}

fn col_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}

fn col_opt_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion(idx, e)))
        .transpose()
}

// ---------------------------------------------------------------------------
// Column lists
// ---------------------------------------------------------------------------

const FEATURE_COLS: &str = "id, name, spec_path, status, created_at, started_at, completed_at";

const CONVOY_COLS: &str = "id, feature_id, story, priority, status, files, dependencies, \
     assignee, created_at, started_at, completed_at";

const TASK_COLS: &str = "id, convoy_id, title, description, file_path, status, assignee, \
     acceptance_criteria, validation_results, failure_reason, failure_count, blocked, \
     created_at, updated_at, started_at, completed_at";

const EVENT_COLS: &str =
    "id, target, event_type, payload, status, error, created_at, processed_at";

const SESSION_COLS: &str = "id, role, convoy_id, task_id, status, last_heartbeat, started_at, \
     crashed_at, restart_failures";

// ---------------------------------------------------------------------------
// SQL-ready column values
// ---------------------------------------------------------------------------

struct FeatureCols {
    id: String,
    name: String,
    spec_path: Option<String>,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl From<&Feature> for FeatureCols {
    fn from(f: &Feature) -> Self {
        Self {
            id: f.id.to_string(),
            name: f.name.clone(),
            spec_path: f.spec_path.clone(),
            status: enum_to_sql(&f.status),
            created_at: ts(&f.created_at),
            started_at: f.started_at.as_ref().map(ts),
            completed_at: f.completed_at.as_ref().map(ts),
        }
    }
}

struct ConvoyCols {
    id: String,
    feature_id: String,
    story: String,
    priority: String,
    status: String,
    files: String,
    dependencies: String,
    assignee: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<&Convoy> for ConvoyCols {
    type Error = StoreError;

    fn try_from(c: &Convoy) -> StoreResult<Self> {
        Ok(Self {
            id: c.id.to_string(),
            feature_id: c.feature_id.to_string(),
            story: c.story.clone(),
            priority: enum_to_sql(&c.priority),
            status: enum_to_sql(&c.status),
            files: to_json(&c.files)?,
            dependencies: to_json(&c.dependencies)?,
            assignee: c.assignee.clone(),
            created_at: ts(&c.created_at),
            started_at: c.started_at.as_ref().map(ts),
            completed_at: c.completed_at.as_ref().map(ts),
        })
    }
}

struct TaskCols {
    id: String,
    convoy_id: String,
    title: String,
    description: String,
    file_path: String,
    status: String,
    assignee: Option<String>,
    acceptance_criteria: String,
    validation_results: Option<String>,
    failure_reason: Option<String>,
    failure_count: u32,
    blocked: bool,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<&Task> for TaskCols {
    type Error = StoreError;

    fn try_from(t: &Task) -> StoreResult<Self> {
        Ok(Self {
            id: t.id.to_string(),
            convoy_id: t.convoy_id.to_string(),
            title: t.title.clone(),
            description: t.description.clone(),
            file_path: t.file_path.clone(),
            status: enum_to_sql(&t.status),
            assignee: t.assignee.clone(),
            acceptance_criteria: to_json(&t.acceptance_criteria)?,
            validation_results: t.validation_results.as_ref().map(|v| v.to_string()),
            failure_reason: t.failure_reason.clone(),
            failure_count: t.failure_count,
            blocked: t.blocked,
            created_at: ts(&t.created_at),
            updated_at: ts(&t.updated_at),
            started_at: t.started_at.as_ref().map(ts),
            completed_at: t.completed_at.as_ref().map(ts),
        })
    }
}

fn insert_feature_row(conn: &rusqlite::Connection, f: &FeatureCols) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT INTO features ({FEATURE_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7)"),
        params![
            f.id,
            f.name,
            f.spec_path,
            f.status,
            f.created_at,
            f.started_at,
            f.completed_at
        ],
    )?;
    Ok(())
}

fn insert_convoy_row(conn: &rusqlite::Connection, c: &ConvoyCols) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT INTO convoys ({CONVOY_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)"),
        params![
            c.id,
            c.feature_id,
            c.story,
            c.priority,
            c.status,
            c.files,
            c.dependencies,
            c.assignee,
            c.created_at,
            c.started_at,
            c.completed_at,
        ],
    )?;
    Ok(())
}

fn insert_task_row(conn: &rusqlite::Connection, t: &TaskCols) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)"
        ),
        params![
            t.id,
            t.convoy_id,
            t.title,
            t.description,
            t.file_path,
            t.status,
            t.assignee,
            t.acceptance_criteria,
            t.validation_results,
            t.failure_reason,
            t.failure_count,
            t.blocked,
            t.created_at,
            t.updated_at,
            t.started_at,
            t.completed_at,
        ],
    )?;
    Ok(())
}

/// Run `update` in an immediate transaction. Zero changed rows means the
/// guard failed: distinguish a lost race from a missing row, then roll back.
fn conditional<T>(
    conn: &mut rusqlite::Connection,
    table: &'static str,
    id: &str,
    update: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<usize>,
    reread: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Cas<T>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if update(&tx)? == 0 {
        let exists = tx
            .query_row(
                &format!("SELECT 1 FROM {table} WHERE id = ?1"),
                params![id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        return Ok(if exists { Cas::Lost } else { Cas::Missing });
    }
    let row = reread(&tx)?;
    tx.commit()?;
    Ok(Cas::Applied(row))
}

fn select_by_id<T>(
    conn: &rusqlite::Connection,
    cols: &str,
    table: &str,
    id: &str,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    conn.query_row(
        &format!("SELECT {cols} FROM {table} WHERE id = ?1"),
        params![id],
        map,
    )
}

fn grouped_counts<T: DeserializeOwned>(
    conn: &rusqlite::Connection,
    table: &str,
) -> rusqlite::Result<Vec<(T, u64)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT status, COUNT(*) FROM {table} GROUP BY status ORDER BY status"
    ))?;
    let rows = stmt.query_map([], |r| Ok((col_enum::<T>(r, 0)?, r.get::<_, u64>(1)?)))?;
    rows.collect()
}

impl StateDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS features (
                        id           TEXT PRIMARY KEY,
                        name         TEXT NOT NULL,
                        spec_path    TEXT,
                        status       TEXT NOT NULL
                            CHECK (status IN ('ready','in_progress','done','failed')),
                        created_at   TEXT NOT NULL,
                        started_at   TEXT,
                        completed_at TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_features_status ON features(status);

                    CREATE TABLE IF NOT EXISTS convoys (
                        id           TEXT PRIMARY KEY,
                        feature_id   TEXT NOT NULL REFERENCES features(id),
                        story        TEXT NOT NULL,
                        priority     TEXT NOT NULL CHECK (priority IN ('p1','p2','p3')),
                        status       TEXT NOT NULL
                            CHECK (status IN ('available','blocked','in_progress','done')),
                        files        TEXT NOT NULL,
                        dependencies TEXT NOT NULL,
                        assignee     TEXT,
                        created_at   TEXT NOT NULL,
                        started_at   TEXT,
                        completed_at TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_convoys_feature ON convoys(feature_id, status);

                    CREATE TABLE IF NOT EXISTS tasks (
                        id                  TEXT PRIMARY KEY,
                        convoy_id           TEXT NOT NULL REFERENCES convoys(id),
                        title               TEXT NOT NULL,
                        description         TEXT NOT NULL DEFAULT '',
                        file_path           TEXT NOT NULL,
                        status              TEXT NOT NULL
                            CHECK (status IN ('todo','in_progress','in_review','in_tests','in_docs','done')),
                        assignee            TEXT,
                        acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                        validation_results  TEXT,
                        failure_reason      TEXT,
                        failure_count       INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0),
                        blocked             INTEGER NOT NULL DEFAULT 0,
                        created_at          TEXT NOT NULL,
                        updated_at          TEXT NOT NULL,
                        started_at          TEXT,
                        completed_at        TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_convoy   ON tasks(convoy_id, status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee);

                    CREATE TABLE IF NOT EXISTS events (
                        id           TEXT PRIMARY KEY,
                        target       TEXT NOT NULL,
                        event_type   TEXT NOT NULL,
                        payload      TEXT NOT NULL,
                        status       TEXT NOT NULL
                            CHECK (status IN ('pending','processing','done','failed')),
                        error        TEXT,
                        created_at   TEXT NOT NULL,
                        processed_at TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_events_target ON events(target, status, created_at);

                    CREATE TABLE IF NOT EXISTS agent_sessions (
                        id               TEXT PRIMARY KEY,
                        role             TEXT NOT NULL
                            CHECK (role IN ('manager','cab','refinery','librarian','developer','tester')),
                        convoy_id        TEXT,
                        task_id          TEXT,
                        status           TEXT NOT NULL
                            CHECK (status IN ('active','crashed','hung','stuck')),
                        last_heartbeat   TEXT NOT NULL,
                        started_at       TEXT NOT NULL,
                        crashed_at       TEXT,
                        restart_failures INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_sessions_status ON agent_sessions(status);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Features
    // -----------------------------------------------------------------------

    pub async fn insert_feature(&self, feature: &Feature) -> StoreResult<()> {
        let cols = FeatureCols::from(feature);
        self.conn
            .call(move |conn| {
                insert_feature_row(conn, &cols)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_feature(&self, id: Uuid) -> StoreResult<Option<Feature>> {
        let id = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(select_by_id(conn, FEATURE_COLS, "features", &id, row_to_feature).optional()?)
            })
            .await?;
        Ok(found)
    }

    pub async fn list_features(&self) -> StoreResult<Vec<Feature>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FEATURE_COLS} FROM features ORDER BY created_at"
                ))?;
                let rows = stmt.query_map([], row_to_feature)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    /// The single feature currently `in_progress`, if any.
    pub async fn active_feature(&self) -> StoreResult<Option<Feature>> {
        let found = self
            .conn
            .call(|conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {FEATURE_COLS} FROM features WHERE status = 'in_progress' LIMIT 1"
                        ),
                        [],
                        row_to_feature,
                    )
                    .optional()?)
            })
            .await?;
        Ok(found)
    }

    /// Conditional feature transition. Moving to `in_progress` additionally
    /// requires that no other feature is in progress.
    pub async fn transition_feature(
        &self,
        id: Uuid,
        expected: FeatureStatus,
        new: FeatureStatus,
    ) -> StoreResult<Feature> {
        let id_str = id.to_string();
        let expected_str = enum_to_sql(&expected);
        let new_str = enum_to_sql(&new);
        let now = ts(&Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let changed = tx.execute(
                    "UPDATE features SET status = ?3,
                        started_at   = CASE WHEN ?3 = 'in_progress' THEN ?4 ELSE started_at END,
                        completed_at = CASE WHEN ?3 IN ('done','failed') THEN ?4 ELSE completed_at END
                     WHERE id = ?1 AND status = ?2
                       AND (?3 <> 'in_progress'
                            OR NOT EXISTS (SELECT 1 FROM features WHERE status = 'in_progress'))",
                    params![id_str, expected_str, new_str, now],
                )?;
                if changed == 0 {
                    let current: Option<String> = tx
                        .query_row(
                            "SELECT status FROM features WHERE id = ?1",
                            params![id_str],
                            |r| r.get(0),
                        )
                        .optional()?;
                    return Ok(match current {
                        None => Cas::Missing,
                        Some(s) if s == expected_str => Cas::Busy,
                        Some(_) => Cas::Lost,
                    });
                }
                let feature = select_by_id(&tx, FEATURE_COLS, "features", &id_str, row_to_feature)?;
                tx.commit()?;
                Ok(Cas::Applied(feature))
            })
            .await?;
        outcome.settle("feature", id, enum_to_sql(&expected))
    }

    /// Insert a feature with all of its convoys and tasks and move it to
    /// `in_progress`, all in one transaction. Nothing is written when another
    /// feature is already in progress.
    pub async fn insert_plan(&self, plan: &FeaturePlan) -> StoreResult<Feature> {
        let feature = FeatureCols::from(&plan.feature);
        let convoys = plan
            .convoys
            .iter()
            .map(ConvoyCols::try_from)
            .collect::<StoreResult<Vec<_>>>()?;
        let tasks = plan
            .tasks
            .iter()
            .map(TaskCols::try_from)
            .collect::<StoreResult<Vec<_>>>()?;
        let feature_id = plan.feature.id;
        let now = ts(&Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                insert_feature_row(&tx, &feature)?;
                for c in &convoys {
                    insert_convoy_row(&tx, c)?;
                }
                for t in &tasks {
                    insert_task_row(&tx, t)?;
                }
                let changed = tx.execute(
                    "UPDATE features SET status = 'in_progress', started_at = ?2
                     WHERE id = ?1 AND status = 'ready'
                       AND NOT EXISTS (SELECT 1 FROM features WHERE status = 'in_progress')",
                    params![feature.id, now],
                )?;
                if changed == 0 {
                    // Dropping the transaction rolls every insert back.
                    return Ok(Cas::Busy);
                }
                let row = select_by_id(&tx, FEATURE_COLS, "features", &feature.id, row_to_feature)?;
                tx.commit()?;
                Ok(Cas::Applied(row))
            })
            .await?;
        outcome.settle("feature", feature_id, "ready")
    }

    // -----------------------------------------------------------------------
    // Convoys
    // -----------------------------------------------------------------------

    pub async fn insert_convoy(&self, convoy: &Convoy) -> StoreResult<()> {
        let cols = ConvoyCols::try_from(convoy)?;
        self.conn
            .call(move |conn| {
                insert_convoy_row(conn, &cols)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_convoy(&self, id: Uuid) -> StoreResult<Option<Convoy>> {
        let id = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(select_by_id(conn, CONVOY_COLS, "convoys", &id, row_to_convoy).optional()?)
            })
            .await?;
        Ok(found)
    }

    /// Convoys of a feature in creation order.
    pub async fn list_convoys(&self, feature_id: Uuid) -> StoreResult<Vec<Convoy>> {
        let feature_id = feature_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CONVOY_COLS} FROM convoys WHERE feature_id = ?1
                     ORDER BY created_at, id"
                ))?;
                let rows = stmt.query_map(params![feature_id], row_to_convoy)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    pub async fn list_convoys_by_status(
        &self,
        feature_id: Uuid,
        status: ConvoyStatus,
    ) -> StoreResult<Vec<Convoy>> {
        let feature_id = feature_id.to_string();
        let status = enum_to_sql(&status);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CONVOY_COLS} FROM convoys WHERE feature_id = ?1 AND status = ?2
                     ORDER BY created_at, id"
                ))?;
                let rows = stmt.query_map(params![feature_id, status], row_to_convoy)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    /// Conditional claim: set `new` status and `assignee` iff the convoy is
    /// still `expected`.
    pub async fn claim_convoy(
        &self,
        id: Uuid,
        expected: ConvoyStatus,
        new: ConvoyStatus,
        assignee: &str,
    ) -> StoreResult<Convoy> {
        let id_str = id.to_string();
        let expected_str = enum_to_sql(&expected);
        let new_str = enum_to_sql(&new);
        let assignee = assignee.to_string();
        let now = ts(&Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                let key = id_str.clone();
                Ok(conditional(
                    conn,
                    "convoys",
                    &key,
                    |tx| {
                        tx.execute(
                            "UPDATE convoys SET status = ?3, assignee = ?4,
                                started_at = CASE WHEN ?3 = 'in_progress' THEN ?5 ELSE started_at END
                             WHERE id = ?1 AND status = ?2",
                            params![id_str, expected_str, new_str, assignee, now],
                        )
                    },
                    |tx| select_by_id(tx, CONVOY_COLS, "convoys", &key, row_to_convoy),
                )?)
            })
            .await?;
        outcome.settle("convoy", id, enum_to_sql(&expected))
    }

    /// Replace the mutable convoy fields iff status and assignee still match
    /// `expected`.
    pub async fn swap_convoy(&self, expected: &Convoy, new: &Convoy) -> StoreResult<Convoy> {
        let id = expected.id;
        let exp = ConvoyCols::try_from(expected)?;
        let next = ConvoyCols::try_from(new)?;

        let outcome = self
            .conn
            .call(move |conn| {
                Ok(conditional(
                    conn,
                    "convoys",
                    &exp.id,
                    |tx| {
                        tx.execute(
                            "UPDATE convoys SET status = ?4, assignee = ?5,
                                started_at = ?6, completed_at = ?7
                             WHERE id = ?1 AND status = ?2 AND assignee IS ?3",
                            params![
                                exp.id,
                                exp.status,
                                exp.assignee,
                                next.status,
                                next.assignee,
                                next.started_at,
                                next.completed_at,
                            ],
                        )
                    },
                    |tx| select_by_id(tx, CONVOY_COLS, "convoys", &exp.id, row_to_convoy),
                )?)
            })
            .await?;
        outcome.settle("convoy", id, enum_to_sql(&expected.status))
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn insert_task(&self, task: &Task) -> StoreResult<()> {
        let cols = TaskCols::try_from(task)?;
        self.conn
            .call(move |conn| {
                insert_task_row(conn, &cols)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> StoreResult<Option<Task>> {
        let id = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(select_by_id(conn, TASK_COLS, "tasks", &id, row_to_task).optional()?)
            })
            .await?;
        Ok(found)
    }

    /// Tasks of a convoy in creation order.
    pub async fn list_tasks(&self, convoy_id: Uuid) -> StoreResult<Vec<Task>> {
        let convoy_id = convoy_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLS} FROM tasks WHERE convoy_id = ?1 ORDER BY created_at, id"
                ))?;
                let rows = stmt.query_map(params![convoy_id], row_to_task)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    /// Oldest claimable task of a convoy.
    pub async fn next_todo_task(&self, convoy_id: Uuid) -> StoreResult<Option<Task>> {
        let convoy_id = convoy_id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {TASK_COLS} FROM tasks
                             WHERE convoy_id = ?1 AND status = 'todo' AND blocked = 0
                             ORDER BY created_at, id LIMIT 1"
                        ),
                        params![convoy_id],
                        row_to_task,
                    )
                    .optional()?)
            })
            .await?;
        Ok(found)
    }

    /// Tasks held by `assignee` in any of `statuses`, most recently started
    /// first.
    pub async fn tasks_for_assignee(
        &self,
        assignee: &str,
        statuses: &[TaskStatus],
    ) -> StoreResult<Vec<Task>> {
        let assignee = assignee.to_string();
        let statuses = to_json(&statuses)?;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLS} FROM tasks
                     WHERE assignee = ?1 AND status IN (SELECT value FROM json_each(?2))
                     ORDER BY started_at DESC"
                ))?;
                let rows = stmt.query_map(params![assignee, statuses], row_to_task)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    pub async fn blocked_tasks(&self) -> StoreResult<Vec<Task>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLS} FROM tasks WHERE blocked = 1 ORDER BY updated_at"
                ))?;
                let rows = stmt.query_map([], row_to_task)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    /// Conditional claim `todo -> in_progress` for an unblocked task.
    pub async fn claim_task(&self, id: Uuid, assignee: &str) -> StoreResult<Task> {
        let id_str = id.to_string();
        let assignee = assignee.to_string();
        let now = ts(&Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                let key = id_str.clone();
                Ok(conditional(
                    conn,
                    "tasks",
                    &key,
                    |tx| {
                        tx.execute(
                            "UPDATE tasks SET status = 'in_progress', assignee = ?2,
                                started_at = ?3, updated_at = ?3
                             WHERE id = ?1 AND status = 'todo' AND blocked = 0",
                            params![id_str, assignee, now],
                        )
                    },
                    |tx| select_by_id(tx, TASK_COLS, "tasks", &key, row_to_task),
                )?)
            })
            .await?;
        outcome.settle("task", id, "todo")
    }

    /// Replace the mutable task fields iff status, failure count, blocked
    /// flag and assignee still match `expected`. `updated_at` is stamped here.
    pub async fn swap_task(&self, expected: &Task, new: &Task) -> StoreResult<Task> {
        let id = expected.id;
        let exp = TaskCols::try_from(expected)?;
        let next = TaskCols::try_from(new)?;
        let now = ts(&Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                Ok(conditional(
                    conn,
                    "tasks",
                    &exp.id,
                    |tx| {
                        tx.execute(
                            "UPDATE tasks SET status = ?6, assignee = ?7,
                                acceptance_criteria = ?8, validation_results = ?9,
                                failure_reason = ?10, failure_count = ?11, blocked = ?12,
                                started_at = ?13, completed_at = ?14, updated_at = ?15
                             WHERE id = ?1 AND status = ?2 AND failure_count = ?3
                               AND blocked = ?4 AND assignee IS ?5",
                            params![
                                exp.id,
                                exp.status,
                                exp.failure_count,
                                exp.blocked,
                                exp.assignee,
                                next.status,
                                next.assignee,
                                next.acceptance_criteria,
                                next.validation_results,
                                next.failure_reason,
                                next.failure_count,
                                next.blocked,
                                next.started_at,
                                next.completed_at,
                                now,
                            ],
                        )
                    },
                    |tx| select_by_id(tx, TASK_COLS, "tasks", &exp.id, row_to_task),
                )?)
            })
            .await?;
        outcome.settle("task", id, enum_to_sql(&expected.status))
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        let id = event.id.to_string();
        let target = event.target.clone();
        let event_type = event.event_type.clone();
        let payload = event.payload.to_string();
        let status = enum_to_sql(&event.status);
        let error = event.error.clone();
        let created_at = ts(&event.created_at);
        let processed_at = event.processed_at.as_ref().map(ts);

        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!("INSERT INTO events ({EVENT_COLS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
                    params![id, target, event_type, payload, status, error, created_at, processed_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_event(&self, id: Uuid) -> StoreResult<Option<Event>> {
        let id = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(select_by_id(conn, EVENT_COLS, "events", &id, row_to_event).optional()?)
            })
            .await?;
        Ok(found)
    }

    /// Oldest `pending` event for `target` (insertion order breaks ties).
    pub async fn oldest_pending_event(&self, target: &str) -> StoreResult<Option<Event>> {
        let target = target.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {EVENT_COLS} FROM events
                             WHERE target = ?1 AND status = 'pending'
                             ORDER BY created_at, rowid LIMIT 1"
                        ),
                        params![target],
                        row_to_event,
                    )
                    .optional()?)
            })
            .await?;
        Ok(found)
    }

    /// Events filtered by target and status, oldest first.
    pub async fn list_events(
        &self,
        target: Option<&str>,
        status: Option<EventStatus>,
        limit: usize,
    ) -> StoreResult<Vec<Event>> {
        let target = target.map(str::to_string);
        let status = status.map(|s| enum_to_sql(&s));
        let limit = limit as i64;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLS} FROM events
                     WHERE (?1 IS NULL OR target = ?1) AND (?2 IS NULL OR status = ?2)
                     ORDER BY created_at, rowid LIMIT ?3"
                ))?;
                let rows = stmt.query_map(params![target, status, limit], row_to_event)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    pub async fn count_events(&self, target: &str, status: EventStatus) -> StoreResult<u64> {
        let target = target.to_string();
        let status = enum_to_sql(&status);
        let n = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM events WHERE target = ?1 AND status = ?2",
                    params![target, status],
                    |r| r.get::<_, u64>(0),
                )?)
            })
            .await?;
        Ok(n)
    }

    /// Conditional event transition; `processed_at` is stamped when the event
    /// reaches `done` or `failed`.
    pub async fn transition_event(
        &self,
        id: Uuid,
        expected: EventStatus,
        new: EventStatus,
        error: Option<String>,
    ) -> StoreResult<Event> {
        let id_str = id.to_string();
        let expected_str = enum_to_sql(&expected);
        let new_str = enum_to_sql(&new);
        let now = ts(&Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                let key = id_str.clone();
                Ok(conditional(
                    conn,
                    "events",
                    &key,
                    |tx| {
                        tx.execute(
                            "UPDATE events SET status = ?3, error = COALESCE(?4, error),
                                processed_at = CASE WHEN ?3 IN ('done','failed') THEN ?5
                                                    ELSE processed_at END
                             WHERE id = ?1 AND status = ?2",
                            params![id_str, expected_str, new_str, error, now],
                        )
                    },
                    |tx| select_by_id(tx, EVENT_COLS, "events", &key, row_to_event),
                )?)
            })
            .await?;
        outcome.settle("event", id, enum_to_sql(&expected))
    }

    // -----------------------------------------------------------------------
    // Agent sessions
    // -----------------------------------------------------------------------

    pub async fn upsert_session(&self, session: &AgentSession) -> StoreResult<()> {
        let id = session.id.clone();
        let role = enum_to_sql(&session.role);
        let convoy_id = session.convoy_id.map(|u| u.to_string());
        let task_id = session.task_id.map(|u| u.to_string());
        let status = enum_to_sql(&session.status);
        let last_heartbeat = ts(&session.last_heartbeat);
        let started_at = ts(&session.started_at);
        let crashed_at = session.crashed_at.as_ref().map(ts);
        let restart_failures = session.restart_failures;

        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO agent_sessions ({SESSION_COLS})
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                         ON CONFLICT(id) DO UPDATE SET
                            role=excluded.role, convoy_id=excluded.convoy_id,
                            task_id=excluded.task_id, status=excluded.status,
                            last_heartbeat=excluded.last_heartbeat,
                            crashed_at=excluded.crashed_at,
                            restart_failures=excluded.restart_failures"
                    ),
                    params![
                        id,
                        role,
                        convoy_id,
                        task_id,
                        status,
                        last_heartbeat,
                        started_at,
                        crashed_at,
                        restart_failures,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> StoreResult<Option<AgentSession>> {
        let id = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                Ok(select_by_id(conn, SESSION_COLS, "agent_sessions", &id, row_to_session)
                    .optional()?)
            })
            .await?;
        Ok(found)
    }

    pub async fn list_sessions(&self) -> StoreResult<Vec<AgentSession>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLS} FROM agent_sessions ORDER BY started_at, id"
                ))?;
                let rows = stmt.query_map([], row_to_session)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    pub async fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> StoreResult<Vec<AgentSession>> {
        let status = enum_to_sql(&status);
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLS} FROM agent_sessions WHERE status = ?1
                     ORDER BY started_at, id"
                ))?;
                let rows = stmt.query_map(params![status], row_to_session)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(rows)
    }

    /// Refresh the heartbeat of an `active` session. Returns `false` when the
    /// session is unknown or no longer active.
    pub async fn record_heartbeat(&self, id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let id = id.to_string();
        let at = ts(&at);
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE agent_sessions SET last_heartbeat = ?2
                     WHERE id = ?1 AND status = 'active'",
                    params![id, at],
                )?)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Replace the mutable session fields iff status, heartbeat and restart
    /// failure count still match `expected`.
    pub async fn swap_session(
        &self,
        expected: &AgentSession,
        new: &AgentSession,
    ) -> StoreResult<AgentSession> {
        let id = expected.id.clone();
        let exp_status = enum_to_sql(&expected.status);
        let exp_heartbeat = ts(&expected.last_heartbeat);
        let exp_failures = expected.restart_failures;
        let convoy_id = new.convoy_id.map(|u| u.to_string());
        let task_id = new.task_id.map(|u| u.to_string());
        let status = enum_to_sql(&new.status);
        let crashed_at = new.crashed_at.as_ref().map(ts);
        let restart_failures = new.restart_failures;

        let outcome = self
            .conn
            .call(move |conn| {
                let key = id.clone();
                Ok(conditional(
                    conn,
                    "agent_sessions",
                    &key,
                    |tx| {
                        tx.execute(
                            "UPDATE agent_sessions SET convoy_id = ?5, task_id = ?6,
                                status = ?7, crashed_at = ?8, restart_failures = ?9
                             WHERE id = ?1 AND status = ?2 AND last_heartbeat = ?3
                               AND restart_failures = ?4",
                            params![
                                id,
                                exp_status,
                                exp_heartbeat,
                                exp_failures,
                                convoy_id,
                                task_id,
                                status,
                                crashed_at,
                                restart_failures,
                            ],
                        )
                    },
                    |tx| select_by_id(tx, SESSION_COLS, "agent_sessions", &key, row_to_session),
                )?)
            })
            .await?;
        outcome.settle("session", &expected.id, enum_to_sql(&expected.status))
    }

    /// Record which convoy and task a session is working on. Returns `false`
    /// for an unknown session.
    pub async fn set_session_assignment(
        &self,
        id: &str,
        convoy_id: Option<Uuid>,
        task_id: Option<Uuid>,
    ) -> StoreResult<bool> {
        let id = id.to_string();
        let convoy_id = convoy_id.map(|u| u.to_string());
        let task_id = task_id.map(|u| u.to_string());
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE agent_sessions SET convoy_id = ?2, task_id = ?3 WHERE id = ?1",
                    params![id, convoy_id, task_id],
                )?)
            })
            .await?;
        Ok(changed == 1)
    }

    pub async fn delete_session(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM agent_sessions WHERE id = ?1", params![id])?)
            })
            .await?;
        Ok(changed == 1)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn status_snapshot(&self) -> StoreResult<StatusSnapshot> {
        let snapshot = self
            .conn
            .call(|conn| {
                let blocked_tasks: u64 =
                    conn.query_row("SELECT COUNT(*) FROM tasks WHERE blocked = 1", [], |r| {
                        r.get(0)
                    })?;
                let pending_events: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM events WHERE status = 'pending'",
                    [],
                    |r| r.get(0),
                )?;

                Ok(StatusSnapshot {
                    features: grouped_counts(conn, "features")?,
                    convoys: grouped_counts(conn, "convoys")?,
                    tasks: grouped_counts(conn, "tasks")?,
                    sessions: grouped_counts(conn, "agent_sessions")?,
                    blocked_tasks,
                    pending_events,
                    timestamp: Utc::now(),
                })
            })
            .await?;
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_feature(row: &Row<'_>) -> rusqlite::Result<Feature> {
    Ok(Feature {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        spec_path: row.get(2)?,
        status: col_enum(row, 3)?,
        created_at: col_ts(row, 4)?,
        started_at: col_opt_ts(row, 5)?,
        completed_at: col_opt_ts(row, 6)?,
    })
}

fn row_to_convoy(row: &Row<'_>) -> rusqlite::Result<Convoy> {
    Ok(Convoy {
        id: col_uuid(row, 0)?,
        feature_id: col_uuid(row, 1)?,
        story: row.get(2)?,
        priority: col_enum(row, 3)?,
        status: col_enum(row, 4)?,
        files: col_json(row, 5)?,
        dependencies: col_json(row, 6)?,
        assignee: row.get(7)?,
        created_at: col_ts(row, 8)?,
        started_at: col_opt_ts(row, 9)?,
        completed_at: col_opt_ts(row, 10)?,
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: col_uuid(row, 0)?,
        convoy_id: col_uuid(row, 1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        file_path: row.get(4)?,
        status: col_enum(row, 5)?,
        assignee: row.get(6)?,
        acceptance_criteria: col_json(row, 7)?,
        validation_results: col_opt_json(row, 8)?,
        failure_reason: row.get(9)?,
        failure_count: row.get(10)?,
        blocked: row.get(11)?,
        created_at: col_ts(row, 12)?,
        updated_at: col_ts(row, 13)?,
        started_at: col_opt_ts(row, 14)?,
        completed_at: col_opt_ts(row, 15)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: col_uuid(row, 0)?,
        target: row.get(1)?,
        event_type: row.get(2)?,
        payload: col_json(row, 3)?,
        status: col_enum(row, 4)?,
        error: row.get(5)?,
        created_at: col_ts(row, 6)?,
        processed_at: col_opt_ts(row, 7)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<AgentSession> {
    Ok(AgentSession {
        id: row.get(0)?,
        role: col_enum(row, 1)?,
        convoy_id: col_opt_uuid(row, 2)?,
        task_id: col_opt_uuid(row, 3)?,
        status: col_enum(row, 4)?,
        last_heartbeat: col_ts(row, 5)?,
        started_at: col_ts(row, 6)?,
        crashed_at: col_opt_ts(row, 7)?,
        restart_failures: row.get(8)?,
    })
}
