use std::collections::HashSet;
use std::sync::Arc;

use tl_core::store::TaskStore;
use tl_core::types::Task;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Default maximum number of concurrent runs when none is specified.
const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Claims ready tasks under the concurrency cap.
///
/// Each claimed task comes with an [`OwnedSemaphorePermit`]; the caller holds
/// it for the lifetime of the run and drops it when the run finishes. A claim
/// is only attempted while a permit is free, so the number of dispatched runs
/// never exceeds the cap even before the store is consulted.
pub struct TaskScheduler {
    concurrency_gate: Arc<Semaphore>,
    max_concurrent: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let limit = if max_concurrent == 0 {
            warn!("max_concurrent was 0, defaulting to {DEFAULT_MAX_CONCURRENT}");
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent
        };
        Self {
            concurrency_gate: Arc::new(Semaphore::new(limit)),
            max_concurrent: limit,
        }
    }

    /// Number of run slots currently free.
    pub fn available_slots(&self) -> usize {
        self.concurrency_gate.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Claim the best runnable task, skipping `repo_conflicts`.
    ///
    /// Returns `None` when every slot is taken or nothing is runnable; the
    /// permit is released again in the latter case.
    pub fn try_claim(
        &self,
        store: &dyn TaskStore,
        repo_conflicts: &HashSet<String>,
    ) -> Option<(Task, OwnedSemaphorePermit)> {
        let permit = match Arc::clone(&self.concurrency_gate).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(max_concurrent = self.max_concurrent, "no free run slot");
                return None;
            }
        };

        let task = store.claim_next_runnable(self.max_concurrent, repo_conflicts)?;
        debug!(
            task_id = %task.id,
            priority = ?task.priority,
            slots_left = self.available_slots(),
            "task claimed"
        );
        Some((task, permit))
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}
