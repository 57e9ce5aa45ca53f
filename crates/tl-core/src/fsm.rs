use uuid::Uuid;

use crate::types::{Task, TaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors raised when a task status change is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The FSM has no edge between the two states.
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    Invalid {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// `ready` and `in_progress` require every blocker to be `done`.
    #[error("unresolved blocker: task {task_id} is waiting on {blockers:?}")]
    UnresolvedBlocker { task_id: Uuid, blockers: Vec<Uuid> },

    /// `done` and `cancelled` are final.
    #[error("task {task_id} is terminal ({status})")]
    Terminal { task_id: Uuid, status: TaskStatus },
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Returns `true` when the FSM has an edge `from -> to`.
///
/// - backlog     -> ready
/// - ready       -> backlog | in_progress
/// - in_progress -> in_review | blocked
/// - in_review   -> done | ready
/// - blocked     -> ready
/// - any non-terminal -> cancelled
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::{Backlog, Blocked, Cancelled, Done, InProgress, InReview, Ready};

    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Backlog, Ready)
            | (Ready, Backlog)
            | (Ready, InProgress)
            | (InProgress, InReview)
            | (InProgress, Blocked)
            | (InReview, Done)
            | (InReview, Ready)
            | (Blocked, Ready)
            | (_, Cancelled)
    )
}

/// Validate moving `task` to `to`.
///
/// `status_of` resolves blocker ids; a blocker that cannot be found counts
/// as unresolved.
pub fn validate(
    task: &Task,
    to: TaskStatus,
    status_of: impl Fn(&Uuid) -> Option<TaskStatus>,
) -> Result<(), TransitionError> {
    let from = task.status();
    if from.is_terminal() {
        return Err(TransitionError::Terminal {
            task_id: task.id,
            status: from,
        });
    }
    if !can_transition(from, to) {
        return Err(TransitionError::Invalid {
            task_id: task.id,
            from,
            to,
        });
    }
    if matches!(to, TaskStatus::Ready | TaskStatus::InProgress) {
        let blockers = unresolved_blockers(task, status_of);
        if !blockers.is_empty() {
            return Err(TransitionError::UnresolvedBlocker {
                task_id: task.id,
                blockers,
            });
        }
    }
    Ok(())
}

/// Blockers of `task` that are not yet `done`.
pub fn unresolved_blockers(
    task: &Task,
    status_of: impl Fn(&Uuid) -> Option<TaskStatus>,
) -> Vec<Uuid> {
    task.blocked_by()
        .iter()
        .filter(|id| status_of(id) != Some(TaskStatus::Done))
        .copied()
        .collect()
}
