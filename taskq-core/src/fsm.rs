//! Legality of task and worker state transitions, and the retry/requeue
//! resolution applied on failure paths.

use crate::error::{Error, Result};
use crate::model::{TaskState, WorkerState};

/// Check a task transition against the lifecycle table. Terminal states are
/// absorbing; admin resets go through the task-update surface, not here.
pub fn check_task_transition(from: TaskState, to: TaskState) -> Result<()> {
    use TaskState::{Cancelled, Failed, Pending, Running, Success};
    let legal = matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Running, Success)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Pending)
    );
    if legal {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition(format!(
            "task cannot move from {from} to {to}"
        )))
    }
}

/// Resolve a failure (reported or timed out) against the retry budget:
/// requeue while budget remains, otherwise fail. The returned count never
/// exceeds `max_retries`.
pub fn resolve_failure(retries: u32, max_retries: u32) -> (TaskState, u32) {
    if retries + 1 <= max_retries {
        (TaskState::Pending, retries + 1)
    } else {
        (TaskState::Failed, retries.min(max_retries))
    }
}

/// Check an operator-reported worker transition. Any of active, suspended
/// and failed may be reported from any state (reactivating a crashed worker
/// requires exactly this explicit report); `crashed` is only entered by the
/// retry accounting.
pub fn check_worker_transition(from: WorkerState, to: WorkerState) -> Result<()> {
    if to == WorkerState::Crashed {
        return Err(Error::InvalidStateTransition(format!(
            "worker cannot be reported from {from} into {to}"
        )));
    }
    Ok(())
}
