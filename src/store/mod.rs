//! Durable job storage on SQLite.
//!
//! [`JobStore`] owns a connection pool and is the only component that writes
//! job rows. Two tables are kept:
//!
//! - `jobs`: every live job, whatever its state
//! - `dead_letters`: jobs that exhausted their retries
//!
//! # Atomic claim
//!
//! [`JobStore::claim_next`] selects the oldest pending job and marks it
//! `processing` in a single `UPDATE ... RETURNING` statement. SQLite takes its
//! write lock before the statement reads, so two concurrent claimers can never
//! both see the same row as pending. Lock contention surfaces as "nothing
//! claimed" and clears on the next poll.

mod rows;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::queue::dead_letter::DeadLetter;
use crate::queue::job::{Job, JobState};

use rows::{
    dead_letter_from_row, encode_payload, encode_result, format_timestamp, job_from_row,
    salvage_job_from_row, DEAD_LETTER_COLUMNS, JOB_COLUMNS,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id          TEXT PRIMARY KEY,
        command     TEXT NOT NULL,
        payload     TEXT NULL,
        mode        TEXT NOT NULL,
        state       TEXT NOT NULL,
        attempts    INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        last_error  TEXT NULL,
        result      TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, created_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id          TEXT PRIMARY KEY,
        command     TEXT NOT NULL,
        payload     TEXT NULL,
        mode        TEXT NOT NULL,
        attempts    INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL,
        last_error  TEXT NULL
    )
    "#,
];

/// A job taken by [`JobStore::claim_next`], now in `processing`.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Ready(Job),
    /// The stored payload or result could not be decoded. Those columns have
    /// been cleared; the job must be failed rather than executed.
    Corrupt { job: Job, error: String },
}

impl Claim {
    pub fn job(&self) -> &Job {
        match self {
            Claim::Ready(job) | Claim::Corrupt { job, .. } => job,
        }
    }
}

/// SQLite-backed job store.
///
/// Cheap to clone; clones share the same pool.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if needed) the database at `path` with a pool of
    /// `max_connections`, one per worker loop plus one for the caller is a
    /// good size.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), max_connections, "Job store opened");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, payload, mode, state, attempts, max_retries,
                created_at, updated_at, last_error, result
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.command)
        .bind(encode_payload(&job.payload)?)
        .bind(job.mode.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(format_timestamp(&job.created_at))
        .bind(format_timestamp(&job.updated_at))
        .bind(&job.last_error)
        .bind(encode_result(&job.result)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write back every mutable field of `job`. `created_at` is never changed.
    pub async fn update(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET command = ?2,
                payload = ?3,
                mode = ?4,
                state = ?5,
                attempts = ?6,
                max_retries = ?7,
                updated_at = ?8,
                last_error = ?9,
                result = ?10
            WHERE id = ?1
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.command)
        .bind(encode_payload(&job.payload)?)
        .bind(job.mode.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(format_timestamp(&job.updated_at))
        .bind(&job.last_error)
        .bind(encode_result(&job.result)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(job.id));
        }
        Ok(())
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fetch_by_id(&self, id: &Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// All live jobs in claim order.
    pub async fn fetch_all(&self) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn fetch_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn count_by_state(&self) -> Result<HashMap<JobState, u64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(state.parse()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    /// Claim the oldest pending job, moving it to `processing`.
    ///
    /// Returns `Ok(None)` when nothing is pending or when the database is
    /// momentarily locked by another claimer. A claimed row whose payload or
    /// result cannot be decoded comes back as [`Claim::Corrupt`] so the caller
    /// can count it as a failed attempt instead of leaving it in `processing`.
    pub async fn claim_next(&self) -> Result<Option<Claim>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                updated_at = MAX(created_at, ?1)
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
              AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );

        let claimed = sqlx::query(&sql)
            .bind(format_timestamp(&Utc::now()))
            .fetch_optional(&self.pool)
            .await;

        let row = match claimed {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) if is_contention(&e) => {
                tracing::warn!(error = %e, "Claim contended, treating as no job available");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (job, defect) = salvage_job_from_row(&row)?;
        match defect {
            None => Ok(Some(Claim::Ready(job))),
            Some(error) => {
                // Persist the cleared columns so later reads of this row succeed
                self.update(&job).await?;
                tracing::error!(job_id = %job.id, error = %error, "Claimed job has undecodable columns");
                Ok(Some(Claim::Corrupt { job, error }))
            }
        }
    }

    /// Move a dead job into `dead_letters` and remove it from `jobs`, in one
    /// transaction.
    pub async fn bury(&self, job: &Job) -> Result<()> {
        if job.state != JobState::Dead {
            return Err(QueueError::InvalidTransition {
                from: job.state,
                to: JobState::Dead,
            });
        }

        let entry = DeadLetter::from_job(job);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dead_letters (
                id, command, payload, mode, attempts, max_retries,
                created_at, updated_at, last_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.command)
        .bind(encode_payload(&entry.payload)?)
        .bind(entry.mode.as_str())
        .bind(i64::from(entry.attempts))
        .bind(i64::from(entry.max_retries))
        .bind(format_timestamp(&entry.created_at))
        .bind(format_timestamp(&entry.updated_at))
        .bind(&entry.last_error)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(entry.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_dead(&self) -> Result<Vec<DeadLetter>> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters ORDER BY updated_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    pub async fn fetch_dead(&self, id: &Uuid) -> Result<Option<DeadLetter>> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    /// Move a dead-letter entry back into `jobs` as a pending job.
    ///
    /// Returns the restored job, or `None` (with nothing changed) if no entry
    /// has that id.
    pub async fn restore_dead(&self, id: &Uuid) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        // Delete first so the transaction holds the write lock from the start.
        let sql = format!("DELETE FROM dead_letters WHERE id = ?1 RETURNING {DEAD_LETTER_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let job = dead_letter_from_row(&row)?.into_pending_job();

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, payload, mode, state, attempts, max_retries,
                created_at, updated_at, last_error, result
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.command)
        .bind(encode_payload(&job.payload)?)
        .bind(job.mode.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(format_timestamp(&job.created_at))
        .bind(format_timestamp(&job.updated_at))
        .bind(&job.last_error)
        .bind(encode_result(&job.result)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(job))
    }

    pub async fn delete_dead(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every dead-letter entry, returning how many were removed.
    pub async fn purge_dead(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dead_letters")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED (any extended code) or an exhausted pool.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            matches!(primary, Some(5) | Some(6)) || db.message().contains("database is locked")
        }
        _ => false,
    }
}
