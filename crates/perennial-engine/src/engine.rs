//! Workflow lifecycle.
//!
//! The `Engine` creates, resumes, and terminates workflows; all step logic
//! lives in [`WorkflowContext`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use perennial_store::{SqliteStore, Store, WorkflowStatus};
use tracing::{error, info, instrument, warn};

use crate::codec::{Codec, JsonCodec};
use crate::context::WorkflowContext;
use crate::error::EngineError;

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Path of the SQLite database backing the store.
  pub database_path: PathBuf,
}

/// The durable execution engine.
///
/// Generic over `C: Codec` to allow different output encodings. Use
/// `Engine::new()` for a SQLite-backed engine with the default JSON codec,
/// or `Engine::with_codec()` to provide your own store and codec.
pub struct Engine<C: Codec = JsonCodec> {
  store: Arc<dyn Store>,
  codec: Arc<C>,
}

impl Engine<JsonCodec> {
  /// Open (or create) the SQLite store at `config.database_path`, including
  /// its schema, and build an engine over it.
  pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
    let store = SqliteStore::open(&config.database_path).await?;
    Ok(Self::with_store(Arc::new(store)))
  }

  /// Build an engine over an already-open store, with the default codec.
  pub fn with_store(store: Arc<dyn Store>) -> Self {
    Self::with_codec(store, JsonCodec)
  }
}

impl<C: Codec> Engine<C> {
  /// Build an engine over an already-open store with a custom codec.
  pub fn with_codec(store: Arc<dyn Store>, codec: C) -> Self {
    Self {
      store,
      codec: Arc::new(codec),
    }
  }

  /// Run or resume the workflow identified by `workflow_id`.
  ///
  /// Creates the workflow record on first call. If the workflow is already
  /// completed this returns Ok immediately without invoking `procedure`.
  /// Otherwise the procedure runs against a context hydrated from the store,
  /// so steps that completed in an earlier execution replay from their
  /// recorded outputs.
  ///
  /// A procedure error marks the workflow failed; calling `execute` again
  /// re-runs the procedure from the top, replaying completed steps and
  /// re-attempting the rest.
  #[instrument(name = "workflow_execute", skip(self, procedure), fields(workflow_id = %workflow_id))]
  pub async fn execute<P, Fut>(&self, workflow_id: &str, procedure: P) -> Result<(), EngineError>
  where
    P: FnOnce(Arc<WorkflowContext<C>>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
  {
    self.store.upsert_workflow(workflow_id).await?;

    if self.store.get_workflow_status(workflow_id).await? == WorkflowStatus::Completed {
      info!(workflow_id, "workflow_already_completed");
      return Ok(());
    }

    let ctx = Arc::new(
      WorkflowContext::hydrate(
        workflow_id.to_string(),
        self.store.clone(),
        self.codec.clone(),
      )
      .await?,
    );

    info!(workflow_id, "workflow_started");

    match procedure(ctx).await {
      Err(err) => {
        error!(workflow_id, error = %err, "workflow_failed");
        // Best effort: the workflow stays resumable either way.
        if let Err(store_err) = self
          .store
          .update_workflow_status(workflow_id, WorkflowStatus::Failed)
          .await
        {
          warn!(workflow_id, error = %store_err, "failed to record workflow failure");
        }
        Err(EngineError::WorkflowFailed {
          workflow_id: workflow_id.to_string(),
          source: err,
        })
      }
      Ok(()) => {
        self
          .store
          .update_workflow_status(workflow_id, WorkflowStatus::Completed)
          .await?;
        info!(workflow_id, "workflow_completed");
        Ok(())
      }
    }
  }

  /// The persisted status of a workflow.
  ///
  /// # Errors
  ///
  /// Returns a not-found store error for an unknown workflow id.
  pub async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, EngineError> {
    Ok(self.store.get_workflow_status(workflow_id).await?)
  }

  /// Release store resources.
  pub async fn close(&self) -> Result<(), EngineError> {
    Ok(self.store.close().await?)
  }
}
