//! SQLite persistence for jobs and dead letters.

use super::{DeadLetterEntry, DeadLetterFilter, Job, JobStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use kindred_crypto::EncryptedData;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// SQLite-backed job store.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

/// Job counts by status, for health reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStoreStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letters: i64,
}

impl JobStore {
    /// Open (or create) a job store at the given path.
    pub async fn from_path(db_path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Internal(format!("mkdir: {e}")))?;
        }
        let url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        // Enable WAL for read/write concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("Job store initialized at {}", db_path.display());
        Ok(store)
    }

    /// In-memory store (for tests).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        debug!("In-memory job store initialized");
        Ok(store)
    }

    /// The underlying pool, shared with the audit logger.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                id              TEXT PRIMARY KEY,
                user_id         TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                status          TEXT NOT NULL,
                payload         TEXT NOT NULL,
                result          TEXT,
                error           TEXT,
                retry_count     INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                started_at      TEXT,
                completed_at    TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_user
             ON jobs(user_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id              TEXT PRIMARY KEY,
                original_job_id TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                payload         TEXT NOT NULL,
                error           TEXT NOT NULL,
                retry_count     INTEGER NOT NULL,
                failed_at       TEXT NOT NULL,
                retried         INTEGER NOT NULL DEFAULT 0,
                retry_job_id    TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_user
             ON dead_letters(user_id, failed_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────

    /// Insert a new pending job with an already-encrypted payload.
    pub async fn create_job(
        &self,
        user_id: &str,
        conversation_id: &str,
        payload: &EncryptedData,
    ) -> Result<Job> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let payload_json = serde_json::to_string(payload)?;

        sqlx::query(
            "INSERT INTO jobs (id, user_id, conversation_id, status, payload,
                               retry_count, created_at, updated_at)
             VALUES (?, ?, ?, 'pending', ?, 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(user_id)
        .bind(conversation_id)
        .bind(&payload_json)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(job_id = %id, user_id = %user_id, "Job created");
        Ok(Job {
            id,
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            status: JobStatus::Pending,
            payload: payload.clone(),
            result: None,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Fetch a job only if it is owned by `user_id`.
    ///
    /// Unknown id and foreign owner are indistinguishable to the caller.
    pub async fn get_for_user(&self, id: Uuid, user_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ? AND user_id = ?")
            .bind(id.to_string())
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Transition pending → processing. Returns false if the job was
    /// not pending (already picked up, completed, or unknown).
    pub async fn mark_processing(&self, id: Uuid) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'processing', started_at = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition processing → completed with an encrypted result.
    pub async fn complete(&self, id: Uuid, result: &EncryptedData) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result_json = serde_json::to_string(result)?;
        sqlx::query(
            "UPDATE jobs SET status = 'completed', result = ?, error = NULL,
                             completed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(&result_json)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transition processing → failed (terminal).
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE jobs SET status = 'failed', error = ?, completed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Failed attempt with retries left: increment retry_count, store
    /// the error summary, reset to pending. Returns the new count.
    pub async fn reset_for_retry(&self, id: Uuid, error: &str) -> Result<u32> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1,
                             error = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(error)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT retry_count FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("retry_count")?;
        Ok(count as u32)
    }

    /// Ids of all pending jobs, oldest first. Used to recover the queue
    /// after a restart.
    pub async fn pending_job_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let id: String = r.try_get("id")?;
                Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad job id: {e}")))
            })
            .collect()
    }

    /// Job counts by status plus the dead-letter backlog.
    pub async fn stats(&self) -> Result<JobStoreStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut stats = JobStoreStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "pending" => stats.pending = n,
                "processing" => stats.processing = n,
                "completed" => stats.completed = n,
                "failed" => stats.failed = n,
                _ => {}
            }
        }
        let row = sqlx::query("SELECT COUNT(*) AS n FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        stats.dead_letters = row.try_get("n")?;
        Ok(stats)
    }

    // ── Dead letters ────────────────────────────────────────────

    /// Snapshot a job that exhausted its retries. The encrypted payload
    /// is copied verbatim.
    pub async fn insert_dead_letter(&self, job: &Job, error: &str) -> Result<DeadLetterEntry> {
        let id = Uuid::new_v4();
        let failed_at = Utc::now();
        let payload_json = serde_json::to_string(&job.payload)?;

        sqlx::query(
            "INSERT INTO dead_letters (id, original_job_id, user_id, conversation_id,
                                       payload, error, retry_count, failed_at, retried)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(job.id.to_string())
        .bind(&job.user_id)
        .bind(&job.conversation_id)
        .bind(&payload_json)
        .bind(error)
        .bind(i64::from(job.retry_count))
        .bind(failed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(DeadLetterEntry {
            id,
            original_job_id: job.id,
            user_id: job.user_id.clone(),
            conversation_id: job.conversation_id.clone(),
            payload: job.payload.clone(),
            error: error.to_string(),
            retry_count: job.retry_count,
            failed_at,
            retried: false,
            retry_job_id: None,
        })
    }

    /// Fetch one dead-letter entry.
    pub async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_dead_letter(&r)).transpose()
    }

    /// List dead-letter entries, newest first.
    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>> {
        let limit = i64::from(filter.limit.unwrap_or(100).min(500));

        // Three filter shapes; keeps the SQL static and bindable.
        let rows = match (&filter.user_id, filter.retried) {
            (Some(user_id), Some(retried)) => {
                sqlx::query(
                    "SELECT * FROM dead_letters WHERE user_id = ? AND retried = ?
                     ORDER BY failed_at DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(i64::from(retried))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(user_id), None) => {
                sqlx::query(
                    "SELECT * FROM dead_letters WHERE user_id = ?
                     ORDER BY failed_at DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(retried)) => {
                sqlx::query(
                    "SELECT * FROM dead_letters WHERE retried = ?
                     ORDER BY failed_at DESC LIMIT ?",
                )
                .bind(i64::from(retried))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query("SELECT * FROM dead_letters ORDER BY failed_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_dead_letter).collect()
    }

    /// Flag an entry as retried, recording the replacement job id.
    /// Returns false if it was already retried (the guard makes retry
    /// idempotent at the entry level).
    pub async fn mark_dead_letter_retried(&self, id: Uuid, retry_job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dead_letters SET retried = 1, retry_job_id = ?
             WHERE id = ? AND retried = 0",
        )
        .bind(retry_job_id.to_string())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp: {e}")))
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value).map_err(|e| Error::Internal(format!("bad uuid: {e}")))
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_str)
        .ok_or_else(|| Error::Internal(format!("unknown job status: {status_str}")))?;

    let payload_json: String = row.try_get("payload")?;
    let payload: EncryptedData = serde_json::from_str(&payload_json)?;

    let result_json: Option<String> = row.try_get("result")?;
    let result = result_json
        .map(|json| serde_json::from_str::<EncryptedData>(&json))
        .transpose()?;

    let retry_count: i64 = row.try_get("retry_count")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(Job {
        id: parse_uuid(row.try_get("id")?)?,
        user_id: row.try_get("user_id")?,
        conversation_id: row.try_get("conversation_id")?,
        status,
        payload,
        result,
        error: row.try_get("error")?,
        retry_count: retry_count as u32,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        updated_at: parse_timestamp(row.try_get("updated_at")?)?,
        started_at: started_at.map(parse_timestamp).transpose()?,
        completed_at: completed_at.map(parse_timestamp).transpose()?,
    })
}

fn row_to_dead_letter(row: &SqliteRow) -> Result<DeadLetterEntry> {
    let payload_json: String = row.try_get("payload")?;
    let payload: EncryptedData = serde_json::from_str(&payload_json)?;

    let retry_count: i64 = row.try_get("retry_count")?;
    let retried: i64 = row.try_get("retried")?;
    let retry_job_id: Option<String> = row.try_get("retry_job_id")?;

    Ok(DeadLetterEntry {
        id: parse_uuid(row.try_get("id")?)?,
        original_job_id: parse_uuid(row.try_get("original_job_id")?)?,
        user_id: row.try_get("user_id")?,
        conversation_id: row.try_get("conversation_id")?,
        payload,
        error: row.try_get("error")?,
        retry_count: retry_count as u32,
        failed_at: parse_timestamp(row.try_get("failed_at")?)?,
        retried: retried != 0,
        retry_job_id: retry_job_id.map(parse_uuid).transpose()?,
    })
}
