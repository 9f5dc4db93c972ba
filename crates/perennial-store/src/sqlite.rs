use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::types::{StepRecord, StepStatus, StepWrite, UpsertOutcome, WorkflowStatus};
use crate::{Error, Store};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
  workflow_id TEXT PRIMARY KEY,
  status TEXT NOT NULL,
  created_at TIMESTAMP NOT NULL,
  updated_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS steps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
  step_id TEXT NOT NULL,
  sequence_num INTEGER NOT NULL,
  step_key TEXT NOT NULL,
  status TEXT NOT NULL,
  output BLOB,
  error TEXT,
  started_at TIMESTAMP NOT NULL,
  completed_at TIMESTAMP,
  UNIQUE (workflow_id, step_key)
);

CREATE INDEX IF NOT EXISTS idx_steps_workflow_seq ON steps (workflow_id, sequence_num);
"#;

/// Bounded retry for transient SQLITE_BUSY contention. Terminal errors are
/// surfaced immediately.
const MAX_BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(10);

/// SQLite-based store implementation.
///
/// The database is opened in WAL mode with a single pooled connection:
/// SQLite allows one writer at a time, and funnelling all access through one
/// connection keeps write contention out of the pool entirely.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Open (or create) the database at `path` and initialize the schema.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path.as_ref())
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options)
      .await?;

    sqlx::raw_sql(SCHEMA).execute(&pool).await?;

    Ok(Self { pool })
  }

  /// Execute a write, retrying on SQLITE_BUSY with linear backoff.
  async fn execute_with_retry<'q, F>(
    &self,
    build: F,
  ) -> Result<sqlx::sqlite::SqliteQueryResult, Error>
  where
    F: Fn() -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
  {
    let mut attempt = 0;
    loop {
      match build().execute(&self.pool).await {
        Ok(result) => return Ok(result),
        Err(err) if is_busy(&err) && attempt < MAX_BUSY_RETRIES => {
          attempt += 1;
          tokio::time::sleep(BUSY_BACKOFF * attempt).await;
        }
        Err(err) => return Err(err.into()),
      }
    }
  }
}

fn is_busy(err: &sqlx::Error) -> bool {
  match err {
    sqlx::Error::Database(db) => {
      let message = db.message();
      message.contains("database is locked") || message.contains("SQLITE_BUSY")
    }
    _ => false,
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn upsert_workflow(&self, workflow_id: &str) -> Result<(), Error> {
    let now = Utc::now();
    self
      .execute_with_retry(|| {
        sqlx::query(
          r#"
          INSERT INTO workflows (workflow_id, status, created_at, updated_at)
          VALUES (?, ?, ?, ?)
          ON CONFLICT(workflow_id) DO NOTHING
          "#,
        )
        .bind(workflow_id)
        .bind(WorkflowStatus::Running)
        .bind(now)
        .bind(now)
      })
      .await?;

    Ok(())
  }

  async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, Error> {
    let status: Option<WorkflowStatus> =
      sqlx::query_scalar("SELECT status FROM workflows WHERE workflow_id = ?")
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

    status.ok_or_else(|| Error::NotFound(format!("workflow '{}'", workflow_id)))
  }

  async fn update_workflow_status(
    &self,
    workflow_id: &str,
    status: WorkflowStatus,
  ) -> Result<(), Error> {
    let now = Utc::now();
    let result = self
      .execute_with_retry(|| {
        sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE workflow_id = ?")
          .bind(status)
          .bind(now)
          .bind(workflow_id)
      })
      .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("workflow '{}'", workflow_id)));
    }

    Ok(())
  }

  async fn upsert_step(&self, step: StepWrite<'_>) -> Result<UpsertOutcome, Error> {
    let now = Utc::now();
    let completed_at = match step.status {
      StepStatus::InProgress => None,
      StepStatus::Completed | StepStatus::Failed => Some(now),
    };

    // The conflict clause refuses to touch a completed record, so a late or
    // racing writer can never downgrade one; started_at survives updates.
    let result = self
      .execute_with_retry(|| {
        sqlx::query(
          r#"
          INSERT INTO steps
            (workflow_id, step_id, sequence_num, step_key, status, output, error, started_at, completed_at)
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
          ON CONFLICT(workflow_id, step_key) DO UPDATE SET
            status = excluded.status,
            output = excluded.output,
            error = excluded.error,
            completed_at = excluded.completed_at
          WHERE steps.status != 'completed'
          "#,
        )
        .bind(step.workflow_id)
        .bind(step.step_id)
        .bind(step.sequence_num)
        .bind(step.step_key)
        .bind(step.status)
        .bind(step.output)
        .bind(step.error)
        .bind(now)
        .bind(completed_at)
      })
      .await?;

    if result.rows_affected() == 0 {
      Ok(UpsertOutcome::AlreadyCompleted)
    } else {
      Ok(UpsertOutcome::Applied)
    }
  }

  async fn get_step(
    &self,
    workflow_id: &str,
    step_key: &str,
  ) -> Result<Option<StepRecord>, Error> {
    let record = sqlx::query_as::<_, StepRecord>(
      r#"
      SELECT workflow_id, step_id, sequence_num, step_key, status, output, error, started_at, completed_at
      FROM steps
      WHERE workflow_id = ? AND step_key = ?
      "#,
    )
    .bind(workflow_id)
    .bind(step_key)
    .fetch_optional(&self.pool)
    .await?;

    Ok(record)
  }

  async fn load_completed(&self, workflow_id: &str) -> Result<HashMap<String, Vec<u8>>, Error> {
    let rows: Vec<(String, Option<Vec<u8>>)> = sqlx::query_as(
      "SELECT step_key, output FROM steps WHERE workflow_id = ? AND status = 'completed'",
    )
    .bind(workflow_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(
      rows
        .into_iter()
        .map(|(step_key, output)| (step_key, output.unwrap_or_default()))
        .collect(),
    )
  }

  async fn load_step_sequences(&self, workflow_id: &str) -> Result<HashMap<String, i64>, Error> {
    let rows: Vec<(String, i64)> =
      sqlx::query_as("SELECT step_id, sequence_num FROM steps WHERE workflow_id = ?")
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

    Ok(rows.into_iter().collect())
  }

  async fn max_sequence_num(&self, workflow_id: &str) -> Result<i64, Error> {
    let max: i64 =
      sqlx::query_scalar("SELECT COALESCE(MAX(sequence_num), 0) FROM steps WHERE workflow_id = ?")
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;

    Ok(max)
  }

  async fn close(&self) -> Result<(), Error> {
    self.pool.close().await;
    Ok(())
  }
}
