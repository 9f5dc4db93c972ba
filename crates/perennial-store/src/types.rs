use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkflowStatus {
  Running,
  Completed,
  Failed,
}

/// Status of a step occurrence within a workflow.
///
/// Only `Completed` records contribute to memoization; `InProgress` and
/// `Failed` records are treated as "not completed" on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum StepStatus {
  InProgress,
  Completed,
  Failed,
}

/// A workflow instance as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowRecord {
  pub workflow_id: String,
  pub status: WorkflowStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// A step occurrence as stored in the database.
///
/// `output` is an opaque byte sequence, present once the step is completed;
/// its interpretation belongs to the engine's codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StepRecord {
  pub workflow_id: String,
  pub step_id: String,
  pub sequence_num: i64,
  pub step_key: String,
  pub status: StepStatus,
  pub output: Option<Vec<u8>>,
  pub error: Option<String>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

/// A step write passed to [`Store::upsert_step`](crate::Store::upsert_step).
#[derive(Debug, Clone, Copy)]
pub struct StepWrite<'a> {
  pub workflow_id: &'a str,
  pub step_key: &'a str,
  pub step_id: &'a str,
  pub sequence_num: i64,
  pub status: StepStatus,
  pub output: Option<&'a [u8]>,
  pub error: Option<&'a str>,
}

/// Outcome of a step upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
  /// The record was inserted or updated.
  Applied,
  /// The existing record is already completed and was left untouched.
  AlreadyCompleted,
}
