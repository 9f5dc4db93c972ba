//! Workflow execution context.
//!
//! One [`WorkflowContext`] is created per `Engine::execute` call and shared,
//! behind an `Arc`, by the procedure and every branch it spawns. It owns the
//! in-memory projection of the workflow's step state: the sequence counter,
//! the step-id to sequence-number map, and the cache of completed outputs.
//! Durable state belongs to the store; the two only meet through the
//! [`Store`] trait.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use perennial_store::{StepStatus, StepWrite, Store, UpsertOutcome};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::error::StepError;
use crate::key::{step_key, validate_step_id};

/// In-memory projection of a workflow's step state.
///
/// Guarded by one mutex; the lock is never held across an await.
struct ContextState {
  /// Highest sequence number handed out so far; seeded from the store on
  /// hydration so resumed workflows never reuse a number.
  next_sequence: i64,
  /// Sequence numbers by step id, across all statuses.
  step_sequences: HashMap<String, i64>,
  /// Outputs of completed steps, by step key.
  completed: HashMap<String, Vec<u8>>,
}

/// The execution context of one workflow invocation.
pub struct WorkflowContext<C: Codec = JsonCodec> {
  workflow_id: String,
  store: Arc<dyn Store>,
  codec: Arc<C>,
  state: Mutex<ContextState>,
  branches: Mutex<JoinSet<anyhow::Result<()>>>,
}

impl<C: Codec> WorkflowContext<C> {
  /// Hydrate a context from the store: completed outputs, step-id
  /// assignments (all statuses), and the sequence high-water mark.
  pub(crate) async fn hydrate(
    workflow_id: String,
    store: Arc<dyn Store>,
    codec: Arc<C>,
  ) -> Result<Self, perennial_store::Error> {
    let completed = store.load_completed(&workflow_id).await?;
    let step_sequences = store.load_step_sequences(&workflow_id).await?;
    let next_sequence = store.max_sequence_num(&workflow_id).await?;

    Ok(Self {
      workflow_id,
      store,
      codec,
      state: Mutex::new(ContextState {
        next_sequence,
        step_sequences,
        completed,
      }),
      branches: Mutex::new(JoinSet::new()),
    })
  }

  /// The id of the workflow this context belongs to.
  pub fn workflow_id(&self) -> &str {
    &self.workflow_id
  }

  /// Execute `body` at most once for this step id, memoizing its output.
  ///
  /// On first encounter the body runs and its output is persisted; on every
  /// later encounter (within this run or after a crash) the recorded output
  /// is returned without running the body. The step id must be non-empty,
  /// must not contain `':'`, and must be stable across runs; loops synthesize
  /// a distinct id per iteration (e.g. `format!("process-file-{i}")`).
  ///
  /// A body error fails the step (the record is marked failed and retried on
  /// the next execution) and is returned unchanged.
  pub async fn step<T, F, Fut>(&self, step_id: &str, body: F) -> Result<T, StepError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
  {
    validate_step_id(step_id)?;

    // The first occurrence of a step id claims the next sequence number;
    // replays reuse the recorded assignment.
    let sequence_num = {
      let mut state = self.state.lock().unwrap();
      match state.step_sequences.get(step_id) {
        Some(seq) => *seq,
        None => {
          state.next_sequence += 1;
          let seq = state.next_sequence;
          state.step_sequences.insert(step_id.to_string(), seq);
          seq
        }
      }
    };
    let step_key = step_key(step_id, sequence_num);

    // Fast path: output already cached in memory.
    let cached = self.state.lock().unwrap().completed.get(&step_key).cloned();
    if let Some(bytes) = cached {
      debug!(workflow_id = %self.workflow_id, step_id, "step_replayed");
      return self.decode_output(step_id, &bytes);
    }

    // Durable check. In-progress and failed records do not count: a crashed
    // or failed body is re-executed.
    if let Some(bytes) = self.completed_output(&step_key).await? {
      debug!(workflow_id = %self.workflow_id, step_id, "step_replayed");
      return self.remember_and_decode(step_id, step_key, bytes);
    }

    // Claim the step before running the body. The in-progress marker is what
    // makes the (step id, sequence number) assignment survive a crash. If
    // the claim is refused, a concurrent branch completed this key between
    // our durable check and now; its recorded output wins.
    let claim = self
      .store
      .upsert_step(StepWrite {
        workflow_id: &self.workflow_id,
        step_key: &step_key,
        step_id,
        sequence_num,
        status: StepStatus::InProgress,
        output: None,
        error: None,
      })
      .await?;
    if claim == UpsertOutcome::AlreadyCompleted {
      return self.replay_recorded(step_id, &step_key).await;
    }

    info!(workflow_id = %self.workflow_id, step_id, sequence_num, "step_started");

    match body().await {
      Err(err) => {
        error!(workflow_id = %self.workflow_id, step_id, error = %err, "step_failed");
        let message = format!("{err:#}");
        let failure = StepWrite {
          workflow_id: &self.workflow_id,
          step_key: &step_key,
          step_id,
          sequence_num,
          status: StepStatus::Failed,
          output: None,
          error: Some(&message),
        };
        if let Err(store_err) = self.store.upsert_step(failure).await {
          warn!(
            workflow_id = %self.workflow_id,
            step_id,
            error = %store_err,
            "failed to record step failure"
          );
        }
        Err(StepError::Body(err))
      }
      Ok(value) => {
        let bytes = self.codec.encode(&value).map_err(|source| StepError::Encode {
          step_id: step_id.to_string(),
          source,
        })?;

        let outcome = self
          .store
          .upsert_step(StepWrite {
            workflow_id: &self.workflow_id,
            step_key: &step_key,
            step_id,
            sequence_num,
            status: StepStatus::Completed,
            output: Some(&bytes),
            error: None,
          })
          .await?;
        if outcome == UpsertOutcome::AlreadyCompleted {
          // A branch running the same step id committed first. Converge on
          // the recorded output so every caller observes one value.
          return self.replay_recorded(step_id, &step_key).await;
        }

        info!(workflow_id = %self.workflow_id, step_id, sequence_num, "step_completed");
        self.state.lock().unwrap().completed.insert(step_key, bytes);
        Ok(value)
      }
    }
  }

  /// Launch a branch that runs concurrently with the procedure.
  ///
  /// Branches share this context and may call [`step`](Self::step); collect
  /// their results with [`join`](Self::join).
  pub fn spawn<F>(&self, branch: F)
  where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    self.branches.lock().unwrap().spawn(branch);
  }

  /// Wait for spawned branches and surface the earliest branch error.
  ///
  /// On error the remaining branches are detached, not aborted: they keep
  /// running to completion in the background, their step records are still
  /// persisted, and their outcomes are discarded. Branches spawned while the
  /// barrier is draining are waited on too.
  pub async fn join(&self) -> anyhow::Result<()> {
    loop {
      let mut set = std::mem::take(&mut *self.branches.lock().unwrap());
      if set.is_empty() {
        return Ok(());
      }
      while let Some(joined) = set.join_next().await {
        match joined {
          Ok(Ok(())) => {}
          Ok(Err(err)) => {
            set.detach_all();
            return Err(err);
          }
          Err(join_err) => {
            set.detach_all();
            return Err(anyhow::anyhow!("workflow branch panicked: {join_err}"));
          }
        }
      }
    }
  }

  /// Re-read a step that a concurrent writer completed and return its
  /// recorded output.
  async fn replay_recorded<T: DeserializeOwned>(
    &self,
    step_id: &str,
    step_key: &str,
  ) -> Result<T, StepError> {
    match self.completed_output(step_key).await? {
      Some(bytes) => {
        debug!(workflow_id = %self.workflow_id, step_id, "step_replayed");
        self.remember_and_decode(step_id, step_key.to_string(), bytes)
      }
      // Completed records are never un-completed, so this cannot happen
      // short of external interference with the store.
      None => Err(StepError::Store(perennial_store::Error::NotFound(format!(
        "completed step '{}'",
        step_key
      )))),
    }
  }

  /// Fetch the durable output of `step_key` if the step is completed.
  async fn completed_output(&self, step_key: &str) -> Result<Option<Vec<u8>>, StepError> {
    let record = self.store.get_step(&self.workflow_id, step_key).await?;
    Ok(
      record
        .filter(|r| r.status == StepStatus::Completed)
        .and_then(|r| r.output),
    )
  }

  fn remember_and_decode<T: DeserializeOwned>(
    &self,
    step_id: &str,
    step_key: String,
    bytes: Vec<u8>,
  ) -> Result<T, StepError> {
    let value = self.decode_output(step_id, &bytes)?;
    self.state.lock().unwrap().completed.insert(step_key, bytes);
    Ok(value)
  }

  fn decode_output<T: DeserializeOwned>(&self, step_id: &str, bytes: &[u8]) -> Result<T, StepError> {
    self.codec.decode(bytes).map_err(|source| StepError::Decode {
      step_id: step_id.to_string(),
      source,
    })
  }
}
