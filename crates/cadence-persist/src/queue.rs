//! Durable job store on SQLite
//!
//! Every state change is a single statement. Lease ownership is enforced in
//! the `WHERE` clause and checked through `rows_affected`, so two workers
//! can never both believe they hold the same job.

use async_trait::async_trait;
use cadence_queue::{
    backend::{
        CreatedRange, DeadLetterFilter, DeadLetterSummary, QueueBackend, QueueError,
        RequeueOutcome,
    },
    dlq::{OrderBy, OrderDir},
    job::{Job, JobId, JobStatus, NewJob},
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

const JOB_COLUMNS: &str = "id, kind, payload, idempotency_key, status, priority, visible_at, \
     lease_owner, lease_expires_at, attempts, last_error, created_at, updated_at";

/// SQLite keeps bound parameters per statement well below this
const ID_CHUNK: usize = 500;

const DEAD_LETTER_RANGE: &str = "status = 'dead_letter' \
     AND (? IS NULL OR created_at >= ?) AND (? IS NULL OR created_at < ?)";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    kind: String,
    payload: String,
    idempotency_key: Option<String>,
    status: String,
    priority: i64,
    visible_at: i64,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    attempts: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            kind: row.kind,
            payload: serde_json::from_str(&row.payload)?,
            idempotency_key: row.idempotency_key,
            status: row.status.parse().map_err(QueueError::Backend)?,
            priority: row.priority as i32,
            visible_at: from_millis(row.visible_at)?,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at.map(from_millis).transpose()?,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRow {
    id: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SummaryRow> for DeadLetterSummary {
    type Error = QueueError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterSummary {
            id: row.id,
            last_error: row.last_error,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

fn range_millis(range: CreatedRange) -> (Option<i64>, Option<i64>) {
    (
        range.from.map(|t| t.timestamp_millis()),
        range.to.map(|t| t.timestamp_millis()),
    )
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Backend(format!("timestamp out of range: {}", ms)))
}

/// Busy/locked databases and pool exhaustion are retryable; the rest is not.
fn map_sqlx(e: sqlx::Error) -> QueueError {
    let transient = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            // SQLITE_BUSY, SQLITE_LOCKED and their extended codes
            .map(|c| matches!(c & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    };
    if transient {
        QueueError::Unavailable(e.to_string())
    } else {
        QueueError::Backend(e.to_string())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Durable queue backend using SQLite
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
}

impl SqliteQueueBackend {
    /// The pool must already be migrated (see [`crate::sqlite::connect`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn status_and_owner(&self, id: JobId) -> Result<Option<(String, Option<String>)>, QueueError> {
        sqlx::query_as("SELECT status, lease_owner FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)
    }

    /// Classify a conditional update that matched no row.
    async fn ownership_error(&self, id: JobId, owner: &str) -> QueueError {
        match self.status_and_owner(id).await {
            Ok(None) => QueueError::NotFound(id),
            Ok(Some(_)) => QueueError::LeaseLost {
                job_id: id,
                owner: owner.to_string(),
            },
            Err(e) => e,
        }
    }

    async fn active_id_for_key(&self, kind: &str, key: &str) -> Result<Option<JobId>, QueueError> {
        sqlx::query_scalar(
            "SELECT id FROM jobs WHERE kind = ? AND idempotency_key = ? \
             AND status IN ('pending', 'leased')",
        )
        .bind(kind)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobId, QueueError> {
        let payload = serde_json::to_string(&job.payload)?;
        let visible_at = job.visible_at.unwrap_or(now).timestamp_millis();
        let now_ms = now.timestamp_millis();

        // The active row may finish between a conflicting insert and the
        // lookup, in which case the insert is simply tried again.
        for _ in 0..3 {
            let inserted: Option<JobId> = sqlx::query_scalar(
                r#"
                INSERT INTO jobs (kind, payload, idempotency_key, status, priority,
                                  visible_at, attempts, created_at, updated_at)
                VALUES (?, ?, ?, 'pending', ?, ?, 0, ?, ?)
                ON CONFLICT DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&job.kind)
            .bind(&payload)
            .bind(job.idempotency_key.as_deref())
            .bind(job.priority)
            .bind(visible_at)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

            if let Some(id) = inserted {
                return Ok(id);
            }

            let Some(key) = job.idempotency_key.as_deref() else {
                return Err(QueueError::Backend("insert ignored without idempotency key".into()));
            };
            if let Some(existing) = self.active_id_for_key(&job.kind, key).await? {
                debug!(job_id = existing, kind = %job.kind, key, "Idempotent enqueue hit");
                return Ok(existing);
            }
        }

        Err(QueueError::Unavailable(format!(
            "idempotency key contention on kind '{}'",
            job.kind
        )))
    }

    async fn lease(
        &self,
        kind: &str,
        limit: usize,
        owner: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        let now_ms = now.timestamp_millis();
        let expires_ms = (now + visibility_timeout).timestamp_millis();

        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'leased',
                lease_owner = ?,
                lease_expires_at = ?,
                attempts = attempts + 1,
                updated_at = ?
            WHERE id IN (
                SELECT id FROM jobs
                WHERE kind = ?
                  AND ((status = 'pending' AND visible_at <= ?)
                       OR (status = 'leased' AND lease_expires_at < ?))
                ORDER BY priority ASC, created_at ASC, id ASC
                LIMIT ?
            )
            AND ((status = 'pending' AND visible_at <= ?)
                 OR (status = 'leased' AND lease_expires_at < ?))
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(owner)
            .bind(expires_ms)
            .bind(now_ms)
            .bind(kind)
            .bind(now_ms)
            .bind(now_ms)
            .bind(limit as i64)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        // RETURNING order is unspecified
        let mut jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| (j.priority, j.created_at, j.id));
        Ok(jobs)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, QueueError> {
        let expires = now + visibility_timeout;
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
        )
        .bind(expires.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(id, owner).await);
        }
        Ok(expires)
    }

    async fn ack(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'done', lease_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
        )
        .bind(now.timestamp_millis())
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Repeated ack by the same owner
        match self.status_and_owner(id).await? {
            None => Err(QueueError::NotFound(id)),
            Some((status, lease_owner))
                if status == JobStatus::Done.as_str() && lease_owner.as_deref() == Some(owner) =>
            {
                Ok(())
            }
            Some(_) => Err(QueueError::LeaseLost {
                job_id: id,
                owner: owner.to_string(),
            }),
        }
    }

    async fn reschedule(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        visible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', visible_at = ?, lease_owner = NULL,
                lease_expires_at = NULL, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'leased' AND lease_owner = ?
            "#,
        )
        .bind(visible_at.timestamp_millis())
        .bind(error)
        .bind(now.timestamp_millis())
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(id, owner).await);
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dead_letter', lease_owner = NULL, lease_expires_at = NULL,
                last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'leased' AND lease_owner = ?
            "#,
        )
        .bind(error)
        .bind(now.timestamp_millis())
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(self.ownership_error(id, owner).await);
        }
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE status = 'leased' AND (lease_expires_at IS NULL OR lease_expires_at < ?)
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.map(Job::try_from).transpose()
    }

    async fn dead_letter_summaries(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterSummary>, QueueError> {
        const SUMMARY_COLUMNS: &str = "id, last_error, created_at, updated_at";

        let rows: Vec<SummaryRow> = match filter {
            DeadLetterFilter::Created(range) => {
                let (from, to) = range_millis(*range);
                let sql = format!(
                    "SELECT {} FROM jobs WHERE {} ORDER BY created_at ASC, id ASC",
                    SUMMARY_COLUMNS, DEAD_LETTER_RANGE
                );
                sqlx::query_as(&sql)
                    .bind(from)
                    .bind(from)
                    .bind(to)
                    .bind(to)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(map_sqlx)?
            }
            DeadLetterFilter::Ids(ids) => {
                let mut rows = Vec::with_capacity(ids.len());
                for chunk in ids.chunks(ID_CHUNK) {
                    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                        "SELECT {} FROM jobs WHERE status = 'dead_letter' AND id IN (",
                        SUMMARY_COLUMNS
                    ));
                    let mut separated = qb.separated(", ");
                    for id in chunk {
                        separated.push_bind(*id);
                    }
                    separated.push_unseparated(")");
                    rows.extend(
                        qb.build_query_as::<SummaryRow>()
                            .fetch_all(&self.pool)
                            .await
                            .map_err(map_sqlx)?,
                    );
                }
                rows.sort_by_key(|r| (r.created_at, r.id));
                rows
            }
        };

        rows.into_iter().map(DeadLetterSummary::try_from).collect()
    }

    async fn dead_letter_page(
        &self,
        range: CreatedRange,
        order_by: OrderBy,
        order_dir: OrderDir,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Job>, u64), QueueError> {
        let (from, to) = range_millis(range);
        let column = match order_by {
            OrderBy::CreatedAt => "created_at",
            OrderBy::UpdatedAt => "updated_at",
        };
        let dir = match order_dir {
            OrderDir::Asc => "ASC",
            OrderDir::Desc => "DESC",
        };

        // Count and page from one read snapshot
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM jobs WHERE {}",
            DEAD_LETTER_RANGE
        ))
        .bind(from)
        .bind(from)
        .bind(to)
        .bind(to)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let sql = format!(
            "SELECT {cols} FROM jobs WHERE {range} \
             ORDER BY {column} {dir}, id {dir} LIMIT ? OFFSET ?",
            cols = JOB_COLUMNS,
            range = DEAD_LETTER_RANGE,
            column = column,
            dir = dir,
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(from)
            .bind(from)
            .bind(to)
            .bind(to)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;

        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total.max(0) as u64))
    }

    async fn dead_letters_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {} FROM jobs WHERE status = 'dead_letter' AND id IN (",
                JOB_COLUMNS
            ));
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let rows: Vec<JobRow> = qb
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
            for row in rows {
                jobs.push(Job::try_from(row)?);
            }
        }
        Ok(jobs)
    }

    async fn requeue_dead_letter(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome, QueueError> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', visible_at = ?, lease_owner = NULL,
                lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'dead_letter'
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() > 0 => Ok(RequeueOutcome::Requeued),
            Ok(_) => {
                let outcome = match self.status_and_owner(id).await? {
                    None => RequeueOutcome::NotFound,
                    Some((status, _)) => match status.parse::<JobStatus>() {
                        Ok(JobStatus::Pending) | Ok(JobStatus::Leased) => {
                            RequeueOutcome::AlreadyQueued
                        }
                        Ok(JobStatus::Done) => RequeueOutcome::NotDeadLetter,
                        // Lost a race with a concurrent requeue or purge
                        Ok(JobStatus::DeadLetter) => RequeueOutcome::AlreadyQueued,
                        Err(e) => return Err(QueueError::Backend(e)),
                    },
                };
                Ok(outcome)
            }
            Err(e) if is_unique_violation(&e) => Ok(RequeueOutcome::DuplicateActive),
            Err(e) => Err(map_sqlx(e)),
        }
    }

    async fn delete_dead_letters(&self, ids: &[JobId]) -> Result<u64, QueueError> {
        let mut deleted = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM jobs WHERE status = 'dead_letter' AND id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let result = qb.build().execute(&self.pool).await.map_err(map_sqlx)?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    async fn is_healthy(&self) -> bool {
        !self.pool.is_closed() && sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
