//! Human approval gates.
//!
//! A running pipeline parks at a gate through [`GateKeeper::wait`]; an
//! operator clears it with [`GateKeeper::approve`] or [`GateKeeper::reject`].
//! The gate name supplied by the operator must match the task's
//! `pending_gate` exactly. Cancelling the task releases the waiter at once,
//! whether signalled through [`GateKeeper::cancel`] or seen in the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tl_bridge::event_bus::EventBus;
use tl_bridge::protocol::EventKind;
use tl_core::fsm;
use tl_core::gates::Gate;
use tl_core::store::{StoreError, TaskStore};
use tl_core::types::TaskStatus;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often a parked gate re-reads its task to notice cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("unknown gate: `{0}`")]
    UnknownGate(String),
    #[error("task {0} has no pending gate")]
    NoPendingGate(Uuid),
    #[error("gate mismatch: task is waiting on `{expected}`, got `{got}`")]
    Mismatch { expected: String, got: String },
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateDecision {
    Approved,
    Rejected(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Approved,
    Rejected(String),
    TimedOut(Duration),
    /// The task was cancelled while parked.
    Cancelled,
}

pub fn gate_timeout_message(gate: Gate, timeout: Duration) -> String {
    format!("Gate '{gate}' timed out after {}s", timeout.as_secs())
}

pub fn gate_rejected_message(gate: Gate, reason: &str) -> String {
    format!("Gate '{gate}' rejected: {reason}")
}

impl GateOutcome {
    /// Blocking reason for a failed gate, `None` when approved or cancelled.
    pub fn failure_message(&self, gate: Gate) -> Option<String> {
        match self {
            GateOutcome::Approved | GateOutcome::Cancelled => None,
            GateOutcome::Rejected(reason) => Some(gate_rejected_message(gate, reason)),
            GateOutcome::TimedOut(timeout) => Some(gate_timeout_message(gate, *timeout)),
        }
    }
}

struct Waiter {
    gate: Gate,
    tx: oneshot::Sender<GateDecision>,
}

// ---------------------------------------------------------------------------
// GateKeeper
// ---------------------------------------------------------------------------

pub struct GateKeeper {
    store: Arc<dyn TaskStore>,
    bus: EventBus,
    waiters: Mutex<HashMap<Uuid, Waiter>>,
}

impl GateKeeper {
    pub fn new(store: Arc<dyn TaskStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gate a live pipeline is currently parked on for `task_id`.
    pub fn waiting_on(&self, task_id: Uuid) -> Option<Gate> {
        self.waiters().get(&task_id).map(|w| w.gate)
    }

    /// Park on `gate` until approved, rejected or `timeout` elapses.
    ///
    /// Sets `pending_gate` for the duration. On approval the gate is cleared
    /// and recorded in `metadata.approved_gates`; on rejection or timeout
    /// `pending_gate` stays set for the caller to block the task. A task
    /// cancelled meanwhile ends the wait with [`GateOutcome::Cancelled`].
    pub async fn wait(
        &self,
        task_id: Uuid,
        gate: Gate,
        timeout: Duration,
    ) -> Result<GateOutcome, GateError> {
        let rx = {
            let mut waiters = self.waiters();
            self.store
                .update(task_id, &mut |t| t.pending_gate = Some(gate))?;
            let (tx, rx) = oneshot::channel();
            waiters.insert(task_id, Waiter { gate, tx });
            rx
        };

        info!(task_id = %task_id, gate = %gate, timeout_secs = timeout.as_secs(), "waiting on gate");
        self.bus.emit(
            task_id,
            EventKind::GatePending {
                gate: gate.as_str().to_string(),
            },
            format!("waiting for approval at {gate}"),
        );

        let decision = async {
            tokio::select! {
                decision = rx => decision
                    .unwrap_or_else(|_| GateDecision::Rejected("approval channel closed".to_string())),
                _ = self.cancelled(task_id) => GateDecision::Cancelled,
            }
        };
        let outcome = match tokio::time::timeout(timeout, decision).await {
            Ok(GateDecision::Approved) => GateOutcome::Approved,
            Ok(GateDecision::Rejected(reason)) => GateOutcome::Rejected(reason),
            Ok(GateDecision::Cancelled) => {
                self.waiters().remove(&task_id);
                GateOutcome::Cancelled
            }
            Err(_) => {
                self.waiters().remove(&task_id);
                GateOutcome::TimedOut(timeout)
            }
        };

        match &outcome {
            GateOutcome::Approved => self.clear(task_id, gate)?,
            GateOutcome::Cancelled => {
                info!(task_id = %task_id, gate = %gate, "task cancelled while waiting on gate");
            }
            _ => warn!(task_id = %task_id, gate = %gate, outcome = ?outcome, "gate not approved"),
        }
        Ok(outcome)
    }

    /// Release the run parked on `task_id`'s gate after the task was
    /// cancelled. Returns whether a waiter was woken.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let Some(waiter) = self.waiters().remove(&task_id) else {
            return false;
        };
        debug!(task_id = %task_id, gate = %waiter.gate, "releasing gate waiter");
        waiter.tx.send(GateDecision::Cancelled).is_ok()
    }

    /// Resolves once `task_id` is cancelled or gone from the store.
    async fn cancelled(&self, task_id: Uuid) {
        loop {
            let gone = self
                .store
                .get(task_id)
                .is_none_or(|t| t.status() == TaskStatus::Cancelled);
            if gone {
                return;
            }
            tokio::time::sleep(CANCEL_POLL).await;
        }
    }

    /// Approve the gate `gate_name` on `task_id`.
    ///
    /// With no live waiter (e.g. after a restart) the gate is cleared in the
    /// store and recorded so the next run skips it.
    pub fn approve(&self, task_id: Uuid, gate_name: &str) -> Result<(), GateError> {
        let (gate, waiter) = self.take_matching(task_id, gate_name)?;
        info!(task_id = %task_id, gate = %gate, "gate approved");
        let delivered = waiter.is_some_and(|w| w.tx.send(GateDecision::Approved).is_ok());
        if delivered {
            Ok(())
        } else {
            self.clear(task_id, gate)
        }
    }

    /// Reject the gate `gate_name` on `task_id`; the task becomes `blocked`.
    pub fn reject(&self, task_id: Uuid, gate_name: &str, reason: &str) -> Result<(), GateError> {
        let (gate, waiter) = self.take_matching(task_id, gate_name)?;
        info!(task_id = %task_id, gate = %gate, reason, "gate rejected");
        if let Some(w) = waiter {
            if w.tx.send(GateDecision::Rejected(reason.to_string())).is_ok() {
                return Ok(());
            }
        }

        let message = gate_rejected_message(gate, reason);
        let status = self
            .store
            .get(task_id)
            .ok_or(GateError::NotFound(task_id))?
            .status();
        if fsm::can_transition(status, TaskStatus::Blocked) {
            self.store
                .transition(task_id, TaskStatus::Blocked, Some(message.clone()))?;
            self.bus
                .emit(task_id, EventKind::TaskBlocked { reason: message.clone() }, message);
        } else {
            self.store.update(task_id, &mut |t| t.pending_gate = None)?;
        }
        Ok(())
    }

    /// Validate `gate_name` against the task's pending gate and detach the
    /// live waiter, if any.
    fn take_matching(
        &self,
        task_id: Uuid,
        gate_name: &str,
    ) -> Result<(Gate, Option<Waiter>), GateError> {
        let gate =
            Gate::parse(gate_name).ok_or_else(|| GateError::UnknownGate(gate_name.to_string()))?;
        let mut waiters = self.waiters();
        let task = self.store.get(task_id).ok_or(GateError::NotFound(task_id))?;
        let pending = task.pending_gate.ok_or(GateError::NoPendingGate(task_id))?;
        if pending != gate {
            return Err(GateError::Mismatch {
                expected: pending.as_str().to_string(),
                got: gate_name.to_string(),
            });
        }
        Ok((gate, waiters.remove(&task_id)))
    }

    fn clear(&self, task_id: Uuid, gate: Gate) -> Result<(), GateError> {
        self.store.update(task_id, &mut |t| {
            t.pending_gate = None;
            t.metadata.add_approved_gate(gate);
        })?;
        self.bus.emit(
            task_id,
            EventKind::GateCleared {
                gate: gate.as_str().to_string(),
            },
            format!("{gate} approved"),
        );
        Ok(())
    }
}
