use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to a task.
///
/// Serialized as `{"type": "...", "payload": {...}}` for external consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskClaimed,
    StepStarted { step: String },
    StepCompleted { step: String, ok: bool },
    GatePending { gate: String },
    GateCleared { gate: String },
    ReviewDecision { approved: bool, retry_count: u32 },
    ChildCreated { child_id: Uuid },
    TaskBlocked { reason: String },
    TaskInReview,
    TaskDone,
    TaskCancelled,
    TaskRecovered,
    /// Every blocker of this task is done.
    TaskUnblocked { blocker: Uuid },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task_created",
            EventKind::TaskClaimed => "task_claimed",
            EventKind::StepStarted { .. } => "step_started",
            EventKind::StepCompleted { .. } => "step_completed",
            EventKind::GatePending { .. } => "gate_pending",
            EventKind::GateCleared { .. } => "gate_cleared",
            EventKind::ReviewDecision { .. } => "review_decision",
            EventKind::ChildCreated { .. } => "child_created",
            EventKind::TaskBlocked { .. } => "task_blocked",
            EventKind::TaskInReview => "task_in_review",
            EventKind::TaskDone => "task_done",
            EventKind::TaskCancelled => "task_cancelled",
            EventKind::TaskRecovered => "task_recovered",
            EventKind::TaskUnblocked { .. } => "task_unblocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub task_id: Uuid,
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(task_id: Uuid, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            task_id,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
