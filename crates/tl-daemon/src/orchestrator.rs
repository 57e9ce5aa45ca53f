//! The coordinating loop.
//!
//! Each `tick` sweeps finished runs, stops claiming while draining, starts a
//! dependency analysis pass in the background when none is running, then
//! claims at most one task and dispatches its pipeline run onto the tokio
//! pool. Every dispatch keeps its `JoinHandle` in the in-flight map until a
//! later sweep collects it. The map lock is never held across an `.await` and
//! is disjoint from the store's lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tl_agents::approval::GateError;
use tl_agents::dependency::{AnalysisReport, DependencyAnalyzer};
use tl_agents::executor::{ExecutorError, PipelineExecutor, RunOutcome, INTERNAL_ERROR_MESSAGE};
use tl_bridge::protocol::EventKind;
use tl_core::config::OrchestratorConfig;
use tl_core::store::{StoreError, TaskFilter, TaskStore};
use tl_core::types::{NewTask, Task, TaskStatus};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::scheduler::TaskScheduler;
use crate::shutdown::ShutdownSignal;

const IDLE_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("gate error: {0}")]
    Gate(#[from] GateError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Running,
    /// No new claims; in-flight runs are finishing.
    Draining,
    /// Drained and idle until `resume`.
    Paused,
}

struct InFlight {
    handle: JoinHandle<RunOutcome>,
    repo_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    executor: Arc<PipelineExecutor>,
    scheduler: TaskScheduler,
    analyzer: Option<Arc<DependencyAnalyzer>>,
    /// The analysis pass currently running beside the loop, if any.
    analysis: Mutex<Option<JoinHandle<AnalysisReport>>>,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    state: Mutex<OrchestratorState>,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(executor: Arc<PipelineExecutor>, config: &OrchestratorConfig) -> Self {
        let analyzer = config.analyze_dependencies.then(|| {
            Arc::new(DependencyAnalyzer::new(
                executor.store().clone(),
                executor.adapter().clone(),
            ))
        });
        Self {
            scheduler: TaskScheduler::new(config.concurrency),
            analyzer,
            analysis: Mutex::new(None),
            executor,
            in_flight: Mutex::new(HashMap::new()),
            state: Mutex::new(OrchestratorState::Running),
            poll_interval: config.poll_interval(),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn analysis_guard(&self) -> MutexGuard<'_, Option<JoinHandle<AnalysisReport>>> {
        self.analysis.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_guard(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn executor(&self) -> &Arc<PipelineExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.executor.store()
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state_guard()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.scheduler.max_concurrent()
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// One pass of the loop. Returns the id of the task dispatched, if any.
    pub async fn tick(&self) -> Option<Uuid> {
        self.sweep();

        {
            let mut state = self.state_guard();
            match *state {
                OrchestratorState::Running => {}
                OrchestratorState::Draining => {
                    if self.in_flight().is_empty() {
                        *state = OrchestratorState::Paused;
                        info!("drain complete, orchestrator paused");
                    }
                    return None;
                }
                OrchestratorState::Paused => return None,
            }
        }

        self.start_analysis();

        let conflicts = self.held_repo_paths();
        let (task, permit) = self
            .scheduler
            .try_claim(self.store().as_ref(), &conflicts)?;
        let id = task.id;
        let repo_path = task.repo_path().map(str::to_string);
        info!(task_id = %id, title = %task.title, repo_path = ?repo_path, "dispatching task");
        self.executor
            .bus()
            .emit(id, EventKind::TaskClaimed, task.title.clone());

        let executor = Arc::clone(&self.executor);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            executor.execute_claimed(task).await
        });
        self.in_flight().insert(id, InFlight { handle, repo_path });
        Some(id)
    }

    /// Collect finished dispatches. A dispatch that panicked past the
    /// executor's own containment blocks its task here.
    pub fn sweep(&self) -> usize {
        self.collect_analysis();

        let finished: Vec<(Uuid, InFlight)> = {
            let mut in_flight = self.in_flight();
            let done: Vec<Uuid> = in_flight
                .iter()
                .filter(|(_, f)| f.handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            done.into_iter()
                .filter_map(|id| in_flight.remove(&id).map(|f| (id, f)))
                .collect()
        };

        let count = finished.len();
        for (id, flight) in finished {
            match flight.handle.now_or_never() {
                Some(Ok(outcome)) => {
                    debug!(task_id = %id, outcome = ?outcome, "run collected");
                    if outcome == RunOutcome::Done {
                        self.note_unblocked_dependents(id);
                    }
                }
                Some(Err(e)) if e.is_panic() => {
                    error!(task_id = %id, "dispatched run panicked");
                    self.executor.block(id, INTERNAL_ERROR_MESSAGE.to_string());
                }
                Some(Err(e)) => {
                    warn!(task_id = %id, error = %e, "dispatched run was cancelled");
                }
                None => warn!(task_id = %id, "finished handle was not ready"),
            }
        }
        count
    }

    /// Stop claiming; the loop pauses once in-flight runs finish.
    pub fn drain(&self) {
        let mut state = self.state_guard();
        if *state == OrchestratorState::Running {
            *state = OrchestratorState::Draining;
            info!(in_flight = self.in_flight().len(), "draining");
        }
    }

    pub fn resume(&self) {
        let mut state = self.state_guard();
        if *state != OrchestratorState::Running {
            *state = OrchestratorState::Running;
            info!("orchestrator resumed");
        }
    }

    /// Put tasks stranded `in_progress` by a previous process back to
    /// `ready`. Call once before the loop starts.
    pub fn recover(&self) -> Vec<Uuid> {
        let recovered = self.store().recover_interrupted();
        for id in &recovered {
            self.executor
                .bus()
                .emit(*id, EventKind::TaskRecovered, "recovered after restart");
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted tasks");
        }
        recovered
    }

    /// Wait until every dispatched run has been collected.
    pub async fn wait_idle(&self) {
        loop {
            self.sweep();
            if self.in_flight().is_empty() {
                return;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Nothing in flight and nothing claimable left.
    pub fn is_idle(&self) -> bool {
        self.in_flight().is_empty()
            && self
                .store()
                .list(&TaskFilter::with_status(TaskStatus::Ready))
                .is_empty()
    }

    /// Tick every poll interval until `shutdown`, then drain and wait for
    /// in-flight runs. With `exit_when_idle` the loop also ends once there is
    /// no work left.
    pub async fn run(&self, shutdown: ShutdownSignal, exit_when_idle: bool) {
        info!(
            concurrency = self.scheduler.max_concurrent(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "orchestrator loop started"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("shutdown signal received, draining");
                    break;
                }
                _ = interval.tick() => {
                    // Claim until the pool is full or nothing is runnable.
                    while self.tick().await.is_some() {}
                    if exit_when_idle && self.is_idle() {
                        info!("no work left, stopping");
                        break;
                    }
                }
            }
        }

        self.drain();
        self.wait_idle().await;
        if let Some(analysis) = self.analysis_guard().take() {
            analysis.abort();
        }
        // Moves a drained orchestrator to `Paused`.
        self.tick().await;
        info!("orchestrator loop stopped");
    }

    // -----------------------------------------------------------------------
    // Operator surface
    // -----------------------------------------------------------------------

    /// Create a task, optionally promoting it to `ready` right away.
    pub fn create_task(&self, new: NewTask, ready: bool) -> Result<Task> {
        let task = self.store().create(new)?;
        self.executor
            .bus()
            .emit(task.id, EventKind::TaskCreated, task.title.clone());
        if !ready {
            return Ok(task);
        }
        Ok(self.store().transition(task.id, TaskStatus::Ready, None)?)
    }

    /// Cancel a task. A dispatched run parked at one of its gates ends
    /// right away and its slot is freed on the next sweep.
    pub fn cancel_task(&self, task_id: Uuid, reason: Option<String>) -> Result<Task> {
        Ok(self.executor.cancel_task(task_id, reason)?)
    }

    pub fn approve_gate(&self, task_id: Uuid, gate: &str) -> Result<()> {
        Ok(self.executor.gate_keeper().approve(task_id, gate)?)
    }

    pub fn reject_gate(&self, task_id: Uuid, gate: &str, reason: &str) -> Result<()> {
        Ok(self.executor.gate_keeper().reject(task_id, gate, reason)?)
    }

    pub fn review_decision(
        &self,
        task_id: Uuid,
        approve: bool,
        requested_changes: Option<String>,
    ) -> Result<Task> {
        Ok(self
            .executor
            .review_decision(task_id, approve, requested_changes)?)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn held_repo_paths(&self) -> HashSet<String> {
        self.in_flight()
            .values()
            .filter_map(|f| f.repo_path.clone())
            .collect()
    }

    /// Start a dependency analysis pass unless one is still running. The
    /// pass calls the worker, so it never runs on the loop itself.
    fn start_analysis(&self) {
        let Some(analyzer) = &self.analyzer else { return };
        let mut analysis = self.analysis_guard();
        if analysis.is_some() {
            return;
        }
        let analyzer = Arc::clone(analyzer);
        *analysis = Some(tokio::spawn(async move { analyzer.run_pass().await }));
    }

    fn collect_analysis(&self) {
        let finished = {
            let mut analysis = self.analysis_guard();
            match analysis.as_ref() {
                Some(handle) if handle.is_finished() => analysis.take(),
                _ => None,
            }
        };
        match finished.and_then(|handle| handle.now_or_never()) {
            Some(Ok(report)) if report.analyzed > 0 => {
                debug!(?report, "dependency analysis pass collected");
            }
            Some(Err(e)) => warn!(error = %e, "dependency analysis pass failed"),
            _ => {}
        }
    }

    /// Announce dependents of `id` that no longer wait on anything.
    fn note_unblocked_dependents(&self, id: Uuid) {
        let store = self.store();
        let Some(task) = store.get(id) else { return };
        for dependent in task.blocks() {
            let Some(dependent) = store.get(*dependent) else { continue };
            if !matches!(dependent.status(), TaskStatus::Backlog | TaskStatus::Ready) {
                continue;
            }
            let resolved = dependent.blocked_by().iter().all(|b| {
                store
                    .get(*b)
                    .is_some_and(|t| t.status() == TaskStatus::Done)
            });
            if resolved {
                debug!(task_id = %dependent.id, blocker = %id, "dependent unblocked");
                self.executor.bus().emit(
                    dependent.id,
                    EventKind::TaskUnblocked { blocker: id },
                    format!("blockers resolved by {id}"),
                );
            }
        }
    }
}
