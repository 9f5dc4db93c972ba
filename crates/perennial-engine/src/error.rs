//! Engine errors.

/// Errors that can occur while executing a single step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
  /// The caller-supplied step id violates the key encoding constraints.
  #[error("invalid step id '{step_id}': {reason}")]
  InvalidStepId { step_id: String, reason: &'static str },

  /// A durable read or write failed. The workflow is left resumable.
  #[error("store operation failed")]
  Store(#[from] perennial_store::Error),

  /// The step output could not be encoded for persistence.
  #[error("failed to encode output of step '{step_id}'")]
  Encode {
    step_id: String,
    #[source]
    source: anyhow::Error,
  },

  /// A memoized output could not be decoded.
  #[error("failed to decode memoized output of step '{step_id}'")]
  Decode {
    step_id: String,
    #[source]
    source: anyhow::Error,
  },

  /// The step body returned an error. It is propagated unchanged.
  #[error(transparent)]
  Body(anyhow::Error),
}

/// Errors returned by [`Engine`](crate::Engine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// A durable read or write failed outside any step.
  #[error("store operation failed")]
  Store(#[from] perennial_store::Error),

  /// The workflow procedure returned an error; the workflow is marked
  /// failed and may be re-executed.
  #[error("workflow '{workflow_id}' failed")]
  WorkflowFailed {
    workflow_id: String,
    #[source]
    source: anyhow::Error,
  },
}
