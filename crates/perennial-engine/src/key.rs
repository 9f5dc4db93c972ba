//! Step key generation.

use crate::error::StepError;

/// Separator between the step id and the sequence number in a step key.
pub(crate) const KEY_SEPARATOR: char = ':';

/// Builds the key identifying one step occurrence within a workflow, e.g.
/// `create-user:1`. Unambiguous because step ids may not contain the
/// separator.
pub(crate) fn step_key(step_id: &str, sequence_num: i64) -> String {
  format!("{}{}{}", step_id, KEY_SEPARATOR, sequence_num)
}

/// Checks a caller-supplied step id against the key encoding constraints.
pub(crate) fn validate_step_id(step_id: &str) -> Result<(), StepError> {
  if step_id.is_empty() {
    return Err(StepError::InvalidStepId {
      step_id: step_id.to_string(),
      reason: "step id must not be empty",
    });
  }
  if step_id.contains(KEY_SEPARATOR) {
    return Err(StepError::InvalidStepId {
      step_id: step_id.to_string(),
      reason: "step id must not contain ':'",
    });
  }
  Ok(())
}
