//! Perennial Store
//!
//! This crate provides the storage trait and SQLite implementation for
//! workflow and step records. The engine memoizes step outputs through the
//! [`Store`] trait; everything durable lives behind it.
//!
//! The [`Store`] trait defines operations for:
//! - Creating workflows and updating their status
//! - Claiming, completing, and failing step records
//! - Hydrating the in-memory projection of a workflow on resume

mod sqlite;
mod types;

pub use sqlite::SqliteStore;
pub use types::{
  StepRecord, StepStatus, StepWrite, UpsertOutcome, WorkflowRecord, WorkflowStatus,
};

use std::collections::HashMap;

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Storage trait for workflow and step records.
///
/// Implementations must provide atomic single-record writes and enforce
/// uniqueness of `step_key` within a workflow. Transient contention is the
/// implementation's problem; only terminal failures cross this boundary.
#[async_trait]
pub trait Store: Send + Sync {
  /// Insert a workflow record with status `running` if absent; no-op if the
  /// workflow already exists.
  async fn upsert_workflow(&self, workflow_id: &str) -> Result<(), Error>;

  /// Get the persisted status of a workflow.
  ///
  /// # Errors
  ///
  /// Returns [`Error::NotFound`] for an unknown workflow id.
  async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, Error>;

  /// Overwrite the status of an existing workflow.
  async fn update_workflow_status(
    &self,
    workflow_id: &str,
    status: WorkflowStatus,
  ) -> Result<(), Error>;

  /// Insert a step record, or update the status and optional fields of an
  /// existing one.
  ///
  /// A record that is already `completed` is never modified; such a write
  /// reports [`UpsertOutcome::AlreadyCompleted`] so the caller can re-read
  /// the recorded output instead.
  async fn upsert_step(&self, step: StepWrite<'_>) -> Result<UpsertOutcome, Error>;

  /// Get a step record by step key, if one exists.
  async fn get_step(
    &self,
    workflow_id: &str,
    step_key: &str,
  ) -> Result<Option<StepRecord>, Error>;

  /// Enumerate the outputs of all completed steps of a workflow, keyed by
  /// step key.
  async fn load_completed(&self, workflow_id: &str) -> Result<HashMap<String, Vec<u8>>, Error>;

  /// Enumerate step-id to sequence-number assignments across all statuses,
  /// so that assignments of failed and in-progress steps survive a resume.
  async fn load_step_sequences(&self, workflow_id: &str) -> Result<HashMap<String, i64>, Error>;

  /// The highest sequence number assigned in a workflow, or 0 if the
  /// workflow has no step records.
  async fn max_sequence_num(&self, workflow_id: &str) -> Result<i64, Error>;

  /// Release any resources held by the store.
  async fn close(&self) -> Result<(), Error>;
}
