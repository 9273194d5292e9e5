//! SQLite-backed task store and rate limit ledger.
//!
//! Task rows and counter rows live in one database file. Several
//! `SqliteStore`s (or processes) may open the same file; every operation is
//! either a single conditional statement or a short `IMMEDIATE` transaction,
//! so correctness never depends on in-process locking.
//!
//! Timestamps are stored as Unix milliseconds.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};

use crate::domain::{
    Acquire, Claim, Commit, LimitHolder, LimitKey, LimitScope, Phase, RateLimitCounter, StageName, TaskId, TaskRecord,
    TaskStatus, Tenant, TenantId, WorkerId,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::rate_limit::{LimitTable, RateLimitLedger};
use crate::ports::task_store::{TaskStore, TenantMark, check_tenant_id};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  limits TEXT NOT NULL DEFAULT '{}',
  credentials_ref TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL REFERENCES tenants(id),
  tenant_name TEXT NOT NULL,
  stage TEXT NOT NULL,
  phase TEXT NOT NULL,
  priority INTEGER NOT NULL DEFAULT 0,
  payload TEXT NOT NULL,
  claimed_at_ms INTEGER,
  claimed_by TEXT,
  retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
  next_retry_at_ms INTEGER,
  last_error TEXT,
  created_at_ms INTEGER NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim
  ON tasks(tenant_id, phase, priority DESC, created_at_ms, id);
CREATE INDEX IF NOT EXISTS idx_tasks_phase_claimed
  ON tasks(phase, claimed_at_ms);
CREATE INDEX IF NOT EXISTS idx_tasks_retry
  ON tasks(phase, next_retry_at_ms);

CREATE TABLE IF NOT EXISTS rate_limits (
  scope TEXT NOT NULL,
  service TEXT NOT NULL,
  current_count INTEGER NOT NULL DEFAULT 0 CHECK (current_count >= 0),
  max_concurrent INTEGER NOT NULL,
  window_start_ms INTEGER NOT NULL,
  PRIMARY KEY (scope, service)
);

CREATE TABLE IF NOT EXISTS rate_limit_holds (
  task_id TEXT NOT NULL,
  claimed_by TEXT NOT NULL,
  claimed_at_ms INTEGER NOT NULL,
  scope TEXT NOT NULL,
  service TEXT NOT NULL,
  PRIMARY KEY (task_id, claimed_by, claimed_at_ms, scope, service)
);
"#;

const TASK_COLUMNS: &str = "id, tenant_id, tenant_name, stage, phase, priority, payload, \
     claimed_at_ms, claimed_by, retry_count, next_retry_at_ms, last_error, \
     created_at_ms, updated_at_ms";

/// `?1` is `now` in milliseconds.
const ELIGIBLE: &str = "(phase = 'queued' OR (phase = 'failed' AND \
     (next_retry_at_ms IS NULL OR next_retry_at_ms <= ?1)))";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: Arc<LimitTable>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>, table: LimitTable) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(map_sqlite_err)?;
        Self::init(conn, table)
    }

    /// Private in-memory database; not shareable between stores.
    pub fn open_in_memory(table: LimitTable) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
        Self::init(conn, table)
    }

    fn init(conn: Connection, table: LimitTable) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(map_sqlite_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: Arc::new(table),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task join: {e}")))?
    }
}

fn map_sqlite_err(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            ) =>
        {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn opt_ms_to_dt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(ms_to_dt).transpose()
}

/// Raw column values, decoded into the domain type outside rusqlite's
/// row callback so decode failures become `StoreError::Corrupt`.
struct TaskRow {
    id: String,
    tenant_id: String,
    tenant_name: String,
    stage: String,
    phase: String,
    priority: i32,
    payload: String,
    claimed_at_ms: Option<i64>,
    claimed_by: Option<String>,
    retry_count: i64,
    next_retry_at_ms: Option<i64>,
    last_error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            tenant_name: row.get(2)?,
            stage: row.get(3)?,
            phase: row.get(4)?,
            priority: row.get(5)?,
            payload: row.get(6)?,
            claimed_at_ms: row.get(7)?,
            claimed_by: row.get(8)?,
            retry_count: row.get(9)?,
            next_retry_at_ms: row.get(10)?,
            last_error: row.get(11)?,
            created_at_ms: row.get(12)?,
            updated_at_ms: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        let id = TaskId::parse(&self.id)
            .ok_or_else(|| StoreError::Corrupt(format!("bad task id '{}'", self.id)))?;
        let phase = Phase::parse(&self.phase)
            .ok_or_else(|| StoreError::Corrupt(format!("task {id}: bad phase '{}'", self.phase)))?;
        let claimed_by = match self.claimed_by {
            Some(raw) => Some(WorkerId::parse(&raw).ok_or_else(|| {
                StoreError::Corrupt(format!("task {id}: bad worker id '{raw}'"))
            })?),
            None => None,
        };
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| StoreError::Corrupt(format!("task {id}: payload: {e}")))?;
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| StoreError::Corrupt(format!("task {id}: retry_count out of range")))?;
        Ok(TaskRecord {
            id,
            tenant_id: TenantId::new(self.tenant_id),
            tenant_name: self.tenant_name,
            stage: StageName::new(self.stage),
            phase,
            priority: self.priority,
            payload,
            claimed_at: opt_ms_to_dt(self.claimed_at_ms)?,
            claimed_by,
            retry_count,
            next_retry_at: opt_ms_to_dt(self.next_retry_at_ms)?,
            last_error: self.last_error,
            created_at: ms_to_dt(self.created_at_ms)?,
            updated_at: ms_to_dt(self.updated_at_ms)?,
        })
    }
}

fn claim_from_record(record: &TaskRecord) -> Result<Claim, StoreError> {
    match (record.claimed_by, record.claimed_at) {
        (Some(worker), Some(at)) => Ok(Claim::new(record, worker, at)),
        _ => Err(StoreError::Corrupt(format!(
            "task {}: processing without claim token",
            record.id
        ))),
    }
}

/// Write every mutable column of `record` back to its row.
fn write_back(conn: &Connection, record: &TaskRecord) -> Result<(), StoreError> {
    let payload = serde_json::to_string(&record.payload)
        .map_err(|e| StoreError::Backend(format!("encode payload: {e}")))?;
    conn.execute(
        "UPDATE tasks
         SET stage = ?2, phase = ?3, payload = ?4, claimed_at_ms = ?5, claimed_by = ?6,
             retry_count = ?7, next_retry_at_ms = ?8, last_error = ?9, updated_at_ms = ?10
         WHERE id = ?1",
        params![
            record.id.as_ulid().to_string(),
            record.stage.as_str(),
            record.phase.as_str(),
            payload,
            record.claimed_at.map(dt_to_ms),
            record.claimed_by.map(|w| w.as_ulid().to_string()),
            record.retry_count as i64,
            record.next_retry_at.map(dt_to_ms),
            record.last_error,
            dt_to_ms(record.updated_at),
        ],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

/// Apply `mutate` to the row only if it still carries `claim`, inside one
/// short immediate transaction.
fn update_held<F>(conn: &mut Connection, claim: &Claim, mutate: F) -> Result<Commit, StoreError>
where
    F: FnOnce(&mut TaskRecord),
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(map_sqlite_err)?;
    let row = tx
        .query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE id = ?1 AND phase = 'processing' AND claimed_by = ?2 AND claimed_at_ms = ?3"
            ),
            params![
                claim.task_id.as_ulid().to_string(),
                claim.worker.as_ulid().to_string(),
                dt_to_ms(claim.claimed_at),
            ],
            TaskRow::from_row,
        )
        .optional()
        .map_err(map_sqlite_err)?;
    let Some(row) = row else {
        return Ok(Commit::ClaimLost);
    };
    let mut record = row.into_record()?;
    mutate(&mut record);
    write_back(&tx, &record)?;
    tx.commit().map_err(map_sqlite_err)?;
    Ok(Commit::Applied(record))
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_tenant(
    (id, name, limits, credentials_ref): (String, String, String, Option<String>),
) -> Result<Tenant, StoreError> {
    let limits = serde_json::from_str(&limits)
        .map_err(|e| StoreError::Corrupt(format!("tenant {id}: limits: {e}")))?;
    Ok(Tenant {
        id: TenantId::new(id),
        name,
        limits,
        credentials_ref,
    })
}

fn holder_params(holder: &LimitHolder) -> (String, String, i64) {
    (
        holder.task_id.as_ulid().to_string(),
        holder.worker.as_ulid().to_string(),
        dt_to_ms(holder.claimed_at),
    )
}

/// Delete one hold and decrement its counter if the hold was there.
fn drop_hold(conn: &Connection, key: &LimitKey, holder: &LimitHolder) -> Result<bool, StoreError> {
    let (task, worker, claimed_at) = holder_params(holder);
    let deleted = conn
        .execute(
            "DELETE FROM rate_limit_holds
             WHERE task_id = ?1 AND claimed_by = ?2 AND claimed_at_ms = ?3
               AND scope = ?4 AND service = ?5",
            params![task, worker, claimed_at, key.scope.as_key(), key.service.as_str()],
        )
        .map_err(map_sqlite_err)?;
    if deleted == 0 {
        return Ok(false);
    }
    conn.execute(
        "UPDATE rate_limits SET current_count = MAX(current_count - 1, 0)
         WHERE scope = ?1 AND service = ?2",
        params![key.scope.as_key(), key.service.as_str()],
    )
    .map_err(map_sqlite_err)?;
    Ok(true)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        check_tenant_id(tenant)?;
        let tenant = tenant.clone();
        let limits = serde_json::to_string(&tenant.limits)
            .map_err(|e| StoreError::Backend(format!("encode limits: {e}")))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tenants (id, name, limits, credentials_ref) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   limits = excluded.limits,
                   credentials_ref = excluded.credentials_ref",
                params![tenant.id.as_str(), tenant.name, limits, tenant.credentials_ref],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, limits, credentials_ref FROM tenants WHERE id = ?1",
                params![id.as_str()],
                tenant_from_row,
            )
            .optional()
            .map_err(map_sqlite_err)?
            .map(decode_tenant)
            .transpose()
        })
        .await
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, limits, credentials_ref FROM tenants ORDER BY id")
                .map_err(map_sqlite_err)?;
            let rows = stmt.query_map([], tenant_from_row).map_err(map_sqlite_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(decode_tenant(row.map_err(map_sqlite_err)?)?);
            }
            Ok(out)
        })
        .await
    }

    async fn insert_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let record = record.clone();
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| StoreError::Backend(format!("encode payload: {e}")))?;
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    &format!(
                        "INSERT INTO tasks ({TASK_COLUMNS})
                         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
                         WHERE EXISTS (SELECT 1 FROM tenants WHERE id = ?2)"
                    ),
                    params![
                        record.id.as_ulid().to_string(),
                        record.tenant_id.as_str(),
                        record.tenant_name,
                        record.stage.as_str(),
                        record.phase.as_str(),
                        record.priority,
                        payload,
                        record.claimed_at.map(dt_to_ms),
                        record.claimed_by.map(|w| w.as_ulid().to_string()),
                        record.retry_count as i64,
                        record.next_retry_at.map(dt_to_ms),
                        record.last_error,
                        dt_to_ms(record.created_at),
                        dt_to_ms(record.updated_at),
                    ],
                )
                .map_err(map_sqlite_err)?;
            if inserted == 0 {
                return Err(StoreError::UnknownTenant(record.tenant_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.as_ulid().to_string()],
                TaskRow::from_row,
            )
            .optional()
            .map_err(map_sqlite_err)?
            .map(TaskRow::into_record)
            .transpose()
        })
        .await
    }

    async fn tenant_marks(&self, now: DateTime<Utc>) -> Result<Vec<TenantMark>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT tenant_id, MAX(claimed_at_ms) FROM tasks
                     WHERE tenant_id IN (SELECT DISTINCT tenant_id FROM tasks WHERE {ELIGIBLE})
                     GROUP BY tenant_id
                     ORDER BY tenant_id"
                ))
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map(params![dt_to_ms(now)], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
                })
                .map_err(map_sqlite_err)?;
            let mut out = Vec::new();
            for row in rows {
                let (tenant_id, last_ms) = row.map_err(map_sqlite_err)?;
                out.push(TenantMark {
                    tenant_id: TenantId::new(tenant_id),
                    last_claimed_at: opt_ms_to_dt(last_ms)?,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn claim_next(
        &self,
        tenant: &TenantId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Claim>, StoreError> {
        let tenant = tenant.clone();
        self.with_conn(move |conn| {
            // One statement: SQLite takes the write lock before the subquery
            // runs, so two claimers can never pick the same row.
            let row = conn
                .query_row(
                    &format!(
                        "UPDATE tasks
                         SET phase = 'processing', claimed_at_ms = ?1, claimed_by = ?3,
                             updated_at_ms = ?1
                         WHERE id = (
                           SELECT id FROM tasks
                           WHERE tenant_id = ?2 AND {ELIGIBLE}
                           ORDER BY priority DESC, created_at_ms ASC, id ASC
                           LIMIT 1
                         )
                         AND {ELIGIBLE}
                         RETURNING {TASK_COLUMNS}"
                    ),
                    params![
                        dt_to_ms(now),
                        tenant.as_str(),
                        worker.as_ulid().to_string()
                    ],
                    TaskRow::from_row,
                )
                .optional()
                .map_err(map_sqlite_err)?;
            match row {
                Some(row) => {
                    let record = row.into_record()?;
                    claim_from_record(&record).map(Some)
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn release_claim(
        &self,
        claim: &Claim,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError> {
        let claim = claim.clone();
        self.with_conn(move |conn| update_held(conn, &claim, |record| record.release(now)))
            .await
    }

    async fn advance(
        &self,
        claim: &Claim,
        target: &TaskStatus,
        fields: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError> {
        let claim = claim.clone();
        let target = target.clone();
        let fields = fields.clone();
        self.with_conn(move |conn| {
            update_held(conn, &claim, |record| record.advance(target, &fields, now))
        })
        .await
    }

    async fn record_failure(
        &self,
        claim: &Claim,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Commit, StoreError> {
        let claim = claim.clone();
        let error = error.to_string();
        self.with_conn(move |conn| {
            update_held(conn, &claim, |record| record.fail(error, next_retry_at, now))
        })
        .await
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Claim>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE phase = 'processing' AND claimed_at_ms < ?1
                     ORDER BY claimed_at_ms"
                ))
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map(params![dt_to_ms(cutoff)], TaskRow::from_row)
                .map_err(map_sqlite_err)?;
            let mut out = Vec::new();
            for row in rows {
                let record = row.map_err(map_sqlite_err)?.into_record()?;
                out.push(claim_from_record(&record)?);
            }
            Ok(out)
        })
        .await
    }

    async fn approve_review(
        &self,
        id: TaskId,
        gate: &StageName,
        target: &TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let gate = gate.clone();
        let target = target.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let row = tx
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    params![id.as_ulid().to_string()],
                    TaskRow::from_row,
                )
                .optional()
                .map_err(map_sqlite_err)?;
            let Some(row) = row else {
                return Err(StoreError::NotFound(id));
            };
            let mut record = row.into_record()?;
            if record.phase != Phase::AwaitingReview || record.stage != gate {
                return Ok(None);
            }
            record.advance(target, &serde_json::Map::new(), now);
            write_back(&tx, &record)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(Some(record))
        })
        .await
    }

    async fn earliest_retry_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.with_conn(|conn| {
            let ms: Option<i64> = conn
                .query_row(
                    "SELECT MIN(next_retry_at_ms) FROM tasks WHERE phase = 'failed'",
                    [],
                    |row| row.get(0),
                )
                .map_err(map_sqlite_err)?;
            opt_ms_to_dt(ms)
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT phase, COUNT(*) FROM tasks GROUP BY phase")
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(map_sqlite_err)?;
            let mut counts = QueueCounts::default();
            for row in rows {
                let (phase, n) = row.map_err(map_sqlite_err)?;
                let phase = Phase::parse(&phase)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad phase '{phase}'")))?;
                counts.add(phase, n.max(0) as usize);
            }
            Ok(counts)
        })
        .await
    }
}

#[async_trait]
impl RateLimitLedger for SqliteStore {
    async fn set_limit(
        &self,
        key: &LimitKey,
        max_concurrent: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rate_limits (scope, service, current_count, max_concurrent, window_start_ms)
                 VALUES (?1, ?2, 0, ?3, ?4)
                 ON CONFLICT(scope, service) DO UPDATE SET max_concurrent = excluded.max_concurrent",
                params![
                    key.scope.as_key(),
                    key.service.as_str(),
                    max_concurrent as i64,
                    dt_to_ms(now)
                ],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn try_acquire(
        &self,
        key: &LimitKey,
        holder: &LimitHolder,
        now: DateTime<Utc>,
    ) -> Result<Acquire, StoreError> {
        let key = key.clone();
        let holder = holder.clone();
        let configured = self.table.max_for(&key);
        self.with_conn(move |conn| {
            let scope = key.scope.as_key();
            let service = key.service.as_str();
            let (task, worker, claimed_at) = holder_params(&holder);
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            if let Some(max) = configured {
                tx.execute(
                    "INSERT OR IGNORE INTO rate_limits
                       (scope, service, current_count, max_concurrent, window_start_ms)
                     VALUES (?1, ?2, 0, ?3, ?4)",
                    params![scope, service, max as i64, dt_to_ms(now)],
                )
                .map_err(map_sqlite_err)?;
            }
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM rate_limits WHERE scope = ?1 AND service = ?2)",
                    params![scope, service],
                    |row| row.get(0),
                )
                .map_err(map_sqlite_err)?;
            if !exists {
                return Ok(Acquire::Unlimited);
            }
            let already: bool = tx
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM rate_limit_holds
                     WHERE task_id = ?1 AND claimed_by = ?2 AND claimed_at_ms = ?3
                       AND scope = ?4 AND service = ?5)",
                    params![task, worker, claimed_at, scope, service],
                    |row| row.get(0),
                )
                .map_err(map_sqlite_err)?;
            if already {
                return Ok(Acquire::Granted);
            }
            // Compare-and-increment in one statement. The CASE sees the
            // pre-update count, so the window opens on the 0 -> 1 step.
            let updated = tx
                .execute(
                    "UPDATE rate_limits
                     SET current_count = current_count + 1,
                         window_start_ms = CASE WHEN current_count = 0 THEN ?3 ELSE window_start_ms END
                     WHERE scope = ?1 AND service = ?2 AND current_count < max_concurrent",
                    params![scope, service, dt_to_ms(now)],
                )
                .map_err(map_sqlite_err)?;
            if updated == 0 {
                return Ok(Acquire::Denied);
            }
            tx.execute(
                "INSERT INTO rate_limit_holds (task_id, claimed_by, claimed_at_ms, scope, service)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task, worker, claimed_at, scope, service],
            )
            .map_err(map_sqlite_err)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(Acquire::Granted)
        })
        .await
    }

    async fn release(&self, key: &LimitKey, holder: &LimitHolder) -> Result<bool, StoreError> {
        let key = key.clone();
        let holder = holder.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let released = drop_hold(&tx, &key, &holder)?;
            tx.commit().map_err(map_sqlite_err)?;
            Ok(released)
        })
        .await
    }

    async fn release_holder(&self, holder: &LimitHolder) -> Result<Vec<LimitKey>, StoreError> {
        let holder = holder.clone();
        self.with_conn(move |conn| {
            let (task, worker, claimed_at) = holder_params(&holder);
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_err)?;
            let keys = {
                let mut stmt = tx
                    .prepare(
                        "SELECT scope, service FROM rate_limit_holds
                         WHERE task_id = ?1 AND claimed_by = ?2 AND claimed_at_ms = ?3
                         ORDER BY scope, service",
                    )
                    .map_err(map_sqlite_err)?;
                let rows = stmt
                    .query_map(params![task, worker, claimed_at], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(map_sqlite_err)?;
                let mut keys = Vec::new();
                for row in rows {
                    let (scope, service) = row.map_err(map_sqlite_err)?;
                    keys.push(LimitKey {
                        scope: LimitScope::from_key(&scope),
                        service: service.into(),
                    });
                }
                keys
            };
            for key in &keys {
                drop_hold(&tx, key, &holder)?;
            }
            tx.commit().map_err(map_sqlite_err)?;
            Ok(keys)
        })
        .await
    }

    async fn counter(&self, key: &LimitKey) -> Result<Option<RateLimitCounter>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT current_count, max_concurrent, window_start_ms FROM rate_limits
                     WHERE scope = ?1 AND service = ?2",
                    params![key.scope.as_key(), key.service.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(map_sqlite_err)?;
            let Some((current, max, window_ms)) = row else {
                return Ok(None);
            };
            Ok(Some(RateLimitCounter {
                key: key.clone(),
                current_count: u32::try_from(current)
                    .map_err(|_| StoreError::Corrupt(format!("{key}: bad current_count")))?,
                max_concurrent: u32::try_from(max)
                    .map_err(|_| StoreError::Corrupt(format!("{key}: bad max_concurrent")))?,
                window_start: ms_to_dt(window_ms)?,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, ServiceName};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::HashSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn worker() -> WorkerId {
        WorkerId::from_ulid(ulid::Ulid::new())
    }

    async fn seeded(store: &SqliteStore) {
        store.upsert_tenant(&Tenant::new("acme", "Acme")).await.unwrap();
    }

    async fn insert(store: &SqliteStore, priority: i32, at: DateTime<Utc>) -> TaskId {
        let id = TaskId::from_ulid(ulid::Ulid::new());
        let record = TaskRecord::new(
            id,
            NewTask::new("acme")
                .with_priority(priority)
                .with_payload(serde_json::json!({"title": "t"})),
            "Acme".into(),
            StageName::new("script"),
            at,
        );
        store.insert_task(&record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn tenant_round_trips_with_limits() {
        let store = SqliteStore::open_in_memory(LimitTable::new()).unwrap();
        let tenant = Tenant::new("acme", "Acme")
            .with_limit("video_api", 2)
            .with_credentials_ref("env:ACME_TOKEN");
        store.upsert_tenant(&tenant).await.unwrap();

        assert_eq!(store.get_tenant(&TenantId::new("acme")).await.unwrap(), Some(tenant));
        assert_eq!(store.list_tenants().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_advance_and_read_back() {
        let store = SqliteStore::open_in_memory(LimitTable::new()).unwrap();
        seeded(&store).await;
        let low = insert(&store, 0, t0()).await;
        let high = insert(&store, 3, t0() + ChronoDuration::seconds(1)).await;

        let now = t0() + ChronoDuration::minutes(1);
        let claim = store
            .claim_next(&TenantId::new("acme"), worker(), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.task_id, high);

        let mut fields = serde_json::Map::new();
        fields.insert("script".into(), serde_json::json!("hello"));
        let commit = store
            .advance(&claim, &TaskStatus::queued(StageName::new("render")), &fields, now)
            .await
            .unwrap();
        let record = commit.applied().unwrap();
        assert_eq!(record.stage, StageName::new("render"));
        assert_eq!(record.phase, Phase::Queued);
        assert_eq!(record.payload["script"], "hello");
        assert_eq!(record.payload["title"], "t");

        let stored = store.get_task(high).await.unwrap().unwrap();
        assert_eq!(&stored, record);
        assert!(store.get_task(low).await.unwrap().unwrap().claimed_at.is_none());
    }

    #[tokio::test]
    async fn failure_waits_for_retry_time() {
        let store = SqliteStore::open_in_memory(LimitTable::new()).unwrap();
        seeded(&store).await;
        let id = insert(&store, 0, t0()).await;
        let tenant = TenantId::new("acme");

        let claim = store.claim_next(&tenant, worker(), t0()).await.unwrap().unwrap();
        let retry_at = t0() + ChronoDuration::minutes(1);
        store
            .record_failure(&claim, "503 from render", Some(retry_at), t0())
            .await
            .unwrap();

        assert_eq!(store.earliest_retry_at().await.unwrap(), Some(retry_at));
        assert!(store.claim_next(&tenant, worker(), t0()).await.unwrap().is_none());
        assert!(store.tenant_marks(t0()).await.unwrap().is_empty());

        let again = store.claim_next(&tenant, worker(), retry_at).await.unwrap().unwrap();
        assert_eq!(again.task_id, id);
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn late_write_after_reap_is_claim_lost() {
        let store = SqliteStore::open_in_memory(LimitTable::new()).unwrap();
        seeded(&store).await;
        insert(&store, 0, t0()).await;

        let claim = store
            .claim_next(&TenantId::new("acme"), worker(), t0())
            .await
            .unwrap()
            .unwrap();
        let stale = store.find_stale(t0() + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(stale, vec![claim.clone()]);

        let reaped = store
            .record_failure(&stale[0], "worker timeout or crash", None, t0())
            .await
            .unwrap();
        assert!(reaped.applied().is_some());

        let late = store
            .advance(&claim, &TaskStatus::queued(StageName::new("render")), &serde_json::Map::new(), t0())
            .await
            .unwrap();
        assert_eq!(late, Commit::ClaimLost);
    }

    fn holder() -> LimitHolder {
        LimitHolder::new(TaskId::from_ulid(ulid::Ulid::new()), worker(), t0())
    }

    #[tokio::test]
    async fn ledger_compare_and_increment() {
        let store =
            SqliteStore::open_in_memory(LimitTable::new().per_tenant("video_api", 1)).unwrap();
        let key = LimitKey::tenant(TenantId::new("acme"), ServiceName::new("video_api"));
        let (first, second) = (holder(), holder());

        assert_eq!(store.try_acquire(&key, &first, t0()).await.unwrap(), Acquire::Granted);
        assert_eq!(store.try_acquire(&key, &second, t0()).await.unwrap(), Acquire::Denied);
        assert!(store.release(&key, &first).await.unwrap());
        assert!(!store.release(&key, &first).await.unwrap());

        let counter = store.counter(&key).await.unwrap().unwrap();
        assert_eq!(counter.current_count, 0);
        assert_eq!(counter.window_start, t0());

        let other = LimitKey::global(ServiceName::new("tts"));
        assert_eq!(store.try_acquire(&other, &first, t0()).await.unwrap(), Acquire::Unlimited);
    }

    #[tokio::test]
    async fn holds_of_a_dead_claim_are_released_from_another_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spindle.db");
        let table = LimitTable::new().per_tenant("video_api", 1).global("video_api", 1);
        let crashed = SqliteStore::open(&path, table.clone()).unwrap();
        let survivor = SqliteStore::open(&path, table).unwrap();
        let tenant_key = LimitKey::tenant(TenantId::new("acme"), ServiceName::new("video_api"));
        let global_key = LimitKey::global(ServiceName::new("video_api"));

        let dead = holder();
        crashed.try_acquire(&tenant_key, &dead, t0()).await.unwrap();
        crashed.try_acquire(&global_key, &dead, t0()).await.unwrap();
        drop(crashed);

        assert_eq!(
            survivor.try_acquire(&global_key, &holder(), t0()).await.unwrap(),
            Acquire::Denied
        );
        let released = survivor.release_holder(&dead).await.unwrap();
        assert_eq!(released, vec![global_key.clone(), tenant_key.clone()]);
        assert!(survivor.release_holder(&dead).await.unwrap().is_empty());
        assert_eq!(survivor.counter(&global_key).await.unwrap().unwrap().current_count, 0);
        assert_eq!(survivor.counter(&tenant_key).await.unwrap().unwrap().current_count, 0);
        assert_eq!(
            survivor.try_acquire(&global_key, &holder(), t0()).await.unwrap(),
            Acquire::Granted
        );
    }

    #[tokio::test]
    async fn two_connections_never_claim_the_same_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spindle.db");
        let a = SqliteStore::open(&path, LimitTable::new()).unwrap();
        let b = SqliteStore::open(&path, LimitTable::new()).unwrap();
        seeded(&a).await;
        for _ in 0..30 {
            insert(&a, 0, t0()).await;
        }

        let mut joins = Vec::new();
        for store in [a.clone(), b.clone(), a, b] {
            joins.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(claim) = store
                    .claim_next(&TenantId::new("acme"), worker(), t0())
                    .await
                    .unwrap()
                {
                    got.push(claim.task_id);
                }
                got
            }));
        }
        let mut all = Vec::new();
        for join in joins {
            all.extend(join.await.unwrap());
        }
        let distinct: HashSet<TaskId> = all.iter().copied().collect();
        assert_eq!(all.len(), 30);
        assert_eq!(distinct.len(), 30);
    }
}
