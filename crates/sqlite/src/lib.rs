//! SQLite backend for the queuectl job queue.
//!
//! Jobs live in two tables, `<namespace>_jobs` and `<namespace>_dead`. The
//! pool holds a single connection, so statements and transactions never
//! interleave; claiming is one `UPDATE ... RETURNING` statement and moves
//! between the tables run in one transaction.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use queuectl_core::{Queue, QueueConfig};
//! use queuectl_sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> queuectl_core::Result<()> {
//!     let backend = SqliteBackend::open("jobs.db", "queuectl").await?;
//!     let queue = Queue::new(backend, QueueConfig::default());
//!     queue.create_and_enqueue("echo hello", None).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuectl_core::{Backend, Job, JobId, JobState, QueueError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

const COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at";

/// SQLite backend for job queue storage.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`.
    /// File databases are created if missing.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| QueueError::Config(format!("Invalid SQLite URL {}: {}", database_url, e)))?
            .create_if_missing(true);
        Self::connect(options, namespace).await
    }

    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options, namespace).await
    }

    /// Create an in-memory SQLite backend (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    async fn connect(options: SqliteConnectOptions, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;

        // One connection serializes every write; it must also never be
        // recycled, or an in-memory database would vanish with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(store_err("Failed to connect to SQLite"))?;

        let backend = Self {
            pool,
            namespace: namespace.to_string(),
        };

        // Initialize tables
        backend.init_tables().await?;

        Ok(backend)
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        for table in [self.jobs_table(), self.dead_table()] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    command TEXT NOT NULL,
                    state TEXT NOT NULL,
                    attempts INTEGER NOT NULL,
                    max_retries INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                table
            ))
            .execute(&self.pool)
            .await
            .map_err(store_err("Failed to create table"))?;
        }

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_state_created ON {} (state, created_at, id)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to create index"))?;

        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    fn dead_table(&self) -> String {
        format!("{}_dead", self.namespace)
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(QueueError::Config(format!(
            "Invalid namespace {:?}: use letters, digits and underscores",
            namespace
        )))
    }
}

fn store_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> QueueError {
    move |e| QueueError::StoreUnavailable(format!("{}: {}", context, e))
}

/// A job as stored: timestamps in microseconds since the epoch.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        let corrupt = |what: &str| QueueError::Corrupt(format!("job {}: invalid {}", row.id, what));

        Ok(Job {
            id: row.id.parse().map_err(|_| corrupt("id"))?,
            state: row.state.parse().map_err(|_| corrupt("state"))?,
            attempts: u32::try_from(row.attempts).map_err(|_| corrupt("attempts"))?,
            max_retries: u32::try_from(row.max_retries).map_err(|_| corrupt("max_retries"))?,
            created_at: from_micros(row.created_at).ok_or_else(|| corrupt("created_at"))?,
            updated_at: from_micros(row.updated_at).ok_or_else(|| corrupt("updated_at"))?,
            command: row.command,
        })
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

impl SqliteBackend {
    async fn insert_into<'c, E>(&self, executor: E, table: &str, job: &Job) -> Result<()>
    where
        E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
    {
        sqlx::query(&format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
            table, COLUMNS
        ))
        .bind(job.id.to_string())
        .bind(job.command.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(to_micros(job.created_at))
        .bind(to_micros(job.updated_at))
        .execute(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                QueueError::DuplicateId(job.id)
            }
            other => store_err("Failed to insert job")(other),
        })?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("Failed to begin transaction"))?;

        let (in_dead,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE id = ?",
            self.dead_table()
        ))
        .bind(job.id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err("Failed to check dead letter table"))?;
        if in_dead > 0 {
            return Err(QueueError::DuplicateId(job.id));
        }

        self.insert_into(&mut *tx, &self.jobs_table(), job).await?;

        tx.commit()
            .await
            .map_err(store_err("Failed to commit insert"))?;
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            COLUMNS,
            self.jobs_table()
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("Failed to get job"))?;

        row.map(Job::try_from).transpose()
    }

    async fn update_state(&self, id: &JobId, state: JobState) -> Result<()> {
        if state == JobState::Dead {
            return Err(QueueError::InvalidTransition { id: *id, state });
        }

        let result = sqlx::query(&format!(
            "UPDATE {} SET state = ?, updated_at = ? WHERE id = ?",
            self.jobs_table()
        ))
        .bind(state.as_str())
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to update job state"))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(*id));
        }
        Ok(())
    }

    async fn increment_attempts(&self, id: &JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE {} SET attempts = attempts + 1, updated_at = ? WHERE id = ? RETURNING {}",
            self.jobs_table(),
            COLUMNS
        ))
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("Failed to increment attempts"))?;

        row.ok_or(QueueError::NotFound(*id))?.try_into()
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = match state {
            Some(state) => sqlx::query_as::<_, JobRow>(&format!(
                "SELECT {} FROM {} WHERE state = ? ORDER BY created_at, id",
                COLUMNS,
                self.jobs_table()
            ))
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query_as::<_, JobRow>(&format!(
                "SELECT {} FROM {} ORDER BY created_at, id",
                COLUMNS,
                self.jobs_table()
            ))
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(store_err("Failed to list jobs"))?;

        into_jobs(rows)
    }

    async fn claim_next_pending(&self) -> Result<Option<Job>> {
        let table = self.jobs_table();
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE {table} SET state = 'processing', updated_at = ?
            WHERE id = (
                SELECT id FROM {table}
                WHERE state = 'pending'
                ORDER BY created_at, id
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(to_micros(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("Failed to claim job"))?;

        row.map(Job::try_from).transpose()
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.jobs_table()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_err("Failed to remove job"))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(*id));
        }
        Ok(())
    }

    async fn touch(&self, id: &JobId) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET updated_at = ? WHERE id = ? AND state = 'processing'",
            self.jobs_table()
        ))
        .bind(to_micros(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to touch job"))?;

        if result.rows_affected() == 0 && self.get(id).await?.is_none() {
            return Err(QueueError::NotFound(*id));
        }
        Ok(())
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE {} SET state = 'pending', updated_at = ?
            WHERE state = 'processing' AND updated_at <= ?
            RETURNING {}
            "#,
            self.jobs_table(),
            COLUMNS
        ))
        .bind(to_micros(Utc::now()))
        .bind(to_micros(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("Failed to requeue stale jobs"))?;

        let mut jobs = into_jobs(rows)?;
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn move_to_dead_letter(&self, id: &JobId) -> Result<Job> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("Failed to begin transaction"))?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "DELETE FROM {} WHERE id = ? RETURNING {}",
            self.jobs_table(),
            COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err("Failed to take job"))?;

        let mut job = Job::try_from(row.ok_or(QueueError::NotFound(*id))?)?;
        job.state = JobState::Dead;
        job.updated_at = Utc::now();
        self.insert_into(&mut *tx, &self.dead_table(), &job).await?;

        tx.commit()
            .await
            .map_err(store_err("Failed to commit dead letter move"))?;

        tracing::debug!(job_id = %job.id, "Job moved to dead letter table");
        Ok(job)
    }

    async fn list_dead_letter(&self) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} ORDER BY updated_at, id",
            COLUMNS,
            self.dead_table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("Failed to list dead jobs"))?;

        into_jobs(rows)
    }

    async fn resurrect(&self, id: &JobId) -> Result<Job> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_err("Failed to begin transaction"))?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "DELETE FROM {} WHERE id = ? RETURNING {}",
            self.dead_table(),
            COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err("Failed to take dead job"))?;

        let mut job = Job::try_from(row.ok_or(QueueError::NotFound(*id))?)?;
        job.state = JobState::Pending;
        job.attempts = 0;
        job.updated_at = Utc::now();
        self.insert_into(&mut *tx, &self.jobs_table(), &job).await?;

        tx.commit()
            .await
            .map_err(store_err("Failed to commit resurrect"))?;

        tracing::debug!(job_id = %job.id, "Dead job moved back to jobs table");
        Ok(job)
    }
}
