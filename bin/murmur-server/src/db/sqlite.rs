//! SQLite implementation of [`TaskStore`].
//!
//! Uses [`sqlx`] with the `sqlite` feature. Migrations are embedded at compile
//! time from `./migrations` and run by [`SqliteTaskStore::connect`].
//!
//! Each task is stored as its JSON record plus a few plain columns used for
//! filtering and ordering. Timestamps are RFC 3339 with a fixed number of
//! fractional digits so they sort lexically.
//!
//! The runtime-verified `sqlx::query` form is used so no `DATABASE_URL` is
//! needed at compile time.
//!
//! Writes are serialised in-process and every read-modify-write runs in a
//! `BEGIN IMMEDIATE` transaction, so the write lock is taken before the read
//! and SQLite never has to upgrade a reader under contention.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use murmur_core::{CoreError, Task, TaskFilter, TaskId, TaskMutator, TaskStore};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use tokio::sync::Mutex;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Newest `?2` matches first, then back into submission order.
const LIST_SQL: &str = "SELECT record FROM ( \
        SELECT record, submitted_at, id FROM tts_tasks \
        WHERE ?1 IS NULL OR status = ?1 \
        ORDER BY submitted_at DESC, id DESC LIMIT ?2 \
    ) ORDER BY submitted_at ASC, id ASC";

/// SQLite-backed task store.
#[derive(Debug)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    /// Serialises writes within this process.
    write_lock: Mutex<()>,
}

impl SqliteTaskStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL, e.g. `"sqlite://murmur.db?mode=rwc"`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn put(&self, task: Task) -> Result<(), CoreError> {
        let record = encode(&task)?;
        let now = timestamp(&Utc::now());
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO tts_tasks (id, status, fingerprint, submitted_at, updated_at, record) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(task.id.as_str())
        .bind(task.status.as_ref())
        .bind(task.fingerprint.as_str())
        .bind(timestamp(&task.submitted_at))
        .bind(&now)
        .bind(&record)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, CoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT record FROM tts_tasks WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.map(|(record,)| decode(&record)).transpose()
    }

    async fn update(&self, id: &TaskId, mutate: TaskMutator) -> Result<Task, CoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(store_error)?;

        let row: Option<(String,)> = sqlx::query_as("SELECT record FROM tts_tasks WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;
        let Some((record,)) = row else {
            return Err(CoreError::NotFound {
                task_id: id.clone(),
            });
        };

        let mut task = decode(&record)?;
        // A rejected mutation drops `tx`, which rolls back.
        mutate(&mut task)?;

        sqlx::query("UPDATE tts_tasks SET status = ?1, updated_at = ?2, record = ?3 WHERE id = ?4")
            .bind(task.status.as_ref())
            .bind(timestamp(&Utc::now()))
            .bind(encode(&task)?)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        Ok(task)
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, CoreError> {
        // A negative LIMIT means no limit in SQLite.
        let limit = filter
            .limit
            .map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let rows: Vec<(String,)> = sqlx::query_as(LIST_SQL)
            .bind(filter.status.map(|s| s.as_ref().to_owned()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        rows.iter().map(|(record,)| decode(record)).collect()
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode(task: &Task) -> Result<String, CoreError> {
    serde_json::to_string(task)
        .map_err(|e| CoreError::Store(format!("cannot encode task {}: {e}", task.id)))
}

fn decode(record: &str) -> Result<Task, CoreError> {
    serde_json::from_str(record).map_err(|e| CoreError::Store(format!("corrupt task record: {e}")))
}

fn store_error(err: sqlx::Error) -> CoreError {
    CoreError::Store(err.to_string())
}
