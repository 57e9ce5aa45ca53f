//! PipelineExecutor -- walks a task's step template from claim to a terminal
//! outcome.
//!
//! Per step the executor checks the HITL gate table, calls the worker
//! adapter, and applies the step's special meaning (`review`,
//! `generate_tasks`, `commit`). Every failure inside a run ends as a
//! `blocked` task with a readable `error`; nothing escapes to the caller of
//! [`PipelineExecutor::execute_claimed`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tl_bridge::event_bus::EventBus;
use tl_bridge::protocol::EventKind;
use tl_core::config::GatesConfig;
use tl_core::gates::{gate_after, gate_before, Gate};
use tl_core::pipeline::{steps, PipelineRegistry};
use tl_core::store::{StoreError, TaskStore};
use tl_core::types::{
    Finding, ReviewCycle, ReviewDecision, RunRecord, RunStatus, StepStatus, Task, TaskStatus,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{run_step_contained, StepResult, WorkerAdapter};
use crate::approval::{GateError, GateKeeper, GateOutcome};
use crate::children::spawn_children;
use crate::registry::AgentRegistry;
use crate::review::{cap_message, fix_reentry_index, ReviewLoop, ReviewVerdict};
use crate::vcs::SessionVcs;

/// Error recorded on a task when a step faults or returns a non-ok result.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error during execution";

// ---------------------------------------------------------------------------
// Errors / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("task {task_id} cannot be run from status {status}")]
    NotRunnable { task_id: Uuid, status: TaskStatus },
    #[error("task {0} is not awaiting review")]
    NotInReview(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gate(#[from] GateError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    /// Parked in `in_review` for a human decision.
    InReview,
    Blocked { reason: String },
    /// The task was cancelled while the run was in flight.
    Cancelled,
}

impl RunOutcome {
    fn run_status(&self) -> RunStatus {
        match self {
            RunOutcome::Done => RunStatus::Done,
            RunOutcome::InReview => RunStatus::InReview,
            RunOutcome::Blocked { .. } => RunStatus::Blocked,
            RunOutcome::Cancelled => RunStatus::Interrupted,
        }
    }
}

/// Result of invoking the adapter for one step.
enum StepRun {
    Ok(StepResult),
    Failed,
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

pub struct PipelineExecutor {
    store: Arc<dyn TaskStore>,
    adapter: Arc<dyn WorkerAdapter>,
    bus: EventBus,
    gates: Arc<GateKeeper>,
    pipelines: PipelineRegistry,
    agents: AgentRegistry,
    vcs: Arc<SessionVcs>,
    review: ReviewLoop,
    gate_timeouts: GatesConfig,
}

impl PipelineExecutor {
    pub fn new(store: Arc<dyn TaskStore>, adapter: Arc<dyn WorkerAdapter>, bus: EventBus) -> Self {
        Self {
            gates: Arc::new(GateKeeper::new(store.clone(), bus.clone())),
            agents: AgentRegistry::new(store.clone()),
            store,
            adapter,
            bus,
            pipelines: PipelineRegistry::new(),
            vcs: Arc::new(SessionVcs::disabled()),
            review: ReviewLoop::default(),
            gate_timeouts: GatesConfig::default(),
        }
    }

    pub fn with_pipelines(mut self, pipelines: PipelineRegistry) -> Self {
        self.pipelines = pipelines;
        self
    }

    pub fn with_max_review_attempts(mut self, max: Option<u32>) -> Self {
        self.review = ReviewLoop::new(max);
        self
    }

    pub fn with_gate_timeouts(mut self, timeouts: GatesConfig) -> Self {
        self.gate_timeouts = timeouts;
        self
    }

    pub fn with_vcs(mut self, vcs: Arc<SessionVcs>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn adapter(&self) -> &Arc<dyn WorkerAdapter> {
        &self.adapter
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn gate_keeper(&self) -> &Arc<GateKeeper> {
        &self.gates
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Run `id` inline until it is done, in review, blocked or cancelled.
    ///
    /// A `backlog` task is promoted to `ready` first. Blocker and FSM
    /// violations are returned as errors; anything that goes wrong once the
    /// task is `in_progress` is reported through the outcome.
    pub async fn run_task(&self, id: Uuid) -> Result<RunOutcome, ExecutorError> {
        let task = self.store.get(id).ok_or(ExecutorError::NotFound(id))?;
        match task.status() {
            TaskStatus::Backlog => {
                self.store.transition(id, TaskStatus::Ready, None)?;
            }
            TaskStatus::Ready => {}
            status => return Err(ExecutorError::NotRunnable { task_id: id, status }),
        }
        let task = self.store.start(id)?;
        self.bus
            .emit(id, EventKind::TaskClaimed, "started directly");
        Ok(self.execute_claimed(task).await)
    }

    /// Run a task already marked `in_progress` by the scheduler.
    pub async fn execute_claimed(&self, task: Task) -> RunOutcome {
        let id = task.id;
        let mut run = RunRecord::start(id);
        self.store.save_run(&run);
        info!(task_id = %id, run_id = %run.id, task_type = %task.task_type, "run started");

        let outcome = match self.drive(id, &mut run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %id, error = %e, "run aborted by internal error");
                self.block(id, INTERNAL_ERROR_MESSAGE.to_string())
            }
        };

        run.finish(outcome.run_status());
        self.store.save_run(&run);
        info!(task_id = %id, run_id = %run.id, outcome = ?outcome, "run finished");
        outcome
    }

    /// Operator decision on a task parked in `in_review`.
    ///
    /// Approval completes the task. Otherwise the task returns to `ready`
    /// and its next run starts with `implement_fix` carrying
    /// `requested_changes`.
    pub fn review_decision(
        &self,
        id: Uuid,
        approve: bool,
        requested_changes: Option<String>,
    ) -> Result<Task, ExecutorError> {
        let task = self.store.get(id).ok_or(ExecutorError::NotFound(id))?;
        if task.status() != TaskStatus::InReview {
            return Err(ExecutorError::NotInReview(id));
        }

        let run_id = self
            .store
            .runs_for(id)
            .last()
            .map(|r| r.id)
            .unwrap_or_else(Uuid::nil);
        let changes = requested_changes
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| "Changes requested by reviewer".to_string());
        self.store.record_review(ReviewCycle {
            id: Uuid::new_v4(),
            task_id: id,
            run_id,
            attempt: task.retry_count + 1,
            decision: if approve {
                ReviewDecision::Approved
            } else {
                ReviewDecision::ChangesRequested
            },
            findings: if approve {
                Vec::new()
            } else {
                vec![Finding::new(changes.clone())]
            },
            recorded_at: Utc::now(),
        });
        self.bus.emit(
            id,
            EventKind::ReviewDecision {
                approved: approve,
                retry_count: task.retry_count,
            },
            if approve { "approved by reviewer" } else { "changes requested by reviewer" },
        );

        if approve {
            let task = self.store.transition(id, TaskStatus::Done, None)?;
            self.bus.emit(id, EventKind::TaskDone, "done");
            return Ok(task);
        }
        self.store
            .update(id, &mut |t| t.metadata.set_requested_changes(changes.clone()))?;
        Ok(self.store.transition(id, TaskStatus::Ready, None)?)
    }

    /// Cancel `id` from any status. A run parked on one of its gates is
    /// released immediately and ends as [`RunOutcome::Cancelled`].
    pub fn cancel_task(&self, id: Uuid, reason: Option<String>) -> Result<Task, ExecutorError> {
        let task = self.store.transition(id, TaskStatus::Cancelled, reason)?;
        info!(task_id = %id, "task cancelled");
        self.bus.emit(id, EventKind::TaskCancelled, "cancelled");
        if self.gates.cancel(id) {
            debug!(task_id = %id, "gate waiter released");
        }
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn drive(&self, id: Uuid, run: &mut RunRecord) -> Result<RunOutcome, ExecutorError> {
        let task = self.store.get(id).ok_or(ExecutorError::NotFound(id))?;

        let template = match &task.pipeline_template {
            Some(template) if !template.is_empty() => template.clone(),
            _ => {
                let resolved = self.pipelines.resolve(&task);
                self.store
                    .update(id, &mut |t| t.pipeline_template = Some(resolved.clone()))?;
                resolved
            }
        };
        debug!(task_id = %id, template = ?template, "pipeline resolved");

        let mode = task.effective_hitl_mode();
        let mut approved: HashSet<Gate> = task.metadata.approved_gates().into_iter().collect();
        let mut attempt = task.retry_count + 1;
        let mut index = 0;

        if let Some(changes) = task.metadata.requested_changes().map(str::to_string) {
            let findings = vec![Finding::new(changes)];
            self.store.update(id, &mut |t| {
                t.metadata.set_review_findings(&findings);
                t.metadata.clear_requested_changes();
            })?;
            if let StepRun::Failed = self.run_step(id, steps::IMPLEMENT_FIX, attempt, run).await? {
                return Ok(self.block(id, INTERNAL_ERROR_MESSAGE.to_string()));
            }
            index = human_reentry_index(&template);
        }

        while index < template.len() {
            if self.is_cancelled(id) {
                return Ok(RunOutcome::Cancelled);
            }
            let step = template[index].as_str();

            if let Some(gate) = gate_before(mode, step) {
                if !approved.contains(&gate) {
                    if let Some(outcome) = self.pass_gate(id, gate).await? {
                        return Ok(outcome);
                    }
                    approved.insert(gate);
                }
            }

            let result = match self.run_step(id, step, attempt, run).await? {
                StepRun::Ok(result) => result,
                StepRun::Failed => return Ok(self.block(id, INTERNAL_ERROR_MESSAGE.to_string())),
            };

            let mut next = index + 1;
            match step {
                steps::REVIEW => {
                    let retry_count = self.current(id)?.retry_count;
                    let findings = result.findings().to_vec();
                    let verdict = self.review.evaluate(&findings, retry_count);
                    self.record_review(id, run, retry_count, &findings, verdict);

                    match verdict {
                        ReviewVerdict::Approved => {
                            self.store
                                .update(id, &mut |t| t.metadata.clear_review_findings())?;
                        }
                        ReviewVerdict::Retry { retry_count } => {
                            self.store.update(id, &mut |t| {
                                t.retry_count = retry_count;
                                t.metadata.set_review_findings(&findings);
                            })?;
                            attempt = retry_count + 1;
                            info!(task_id = %id, retry_count, findings = findings.len(), "review requested changes");
                            if let StepRun::Failed =
                                self.run_step(id, steps::IMPLEMENT_FIX, attempt, run).await?
                            {
                                return Ok(self.block(id, INTERNAL_ERROR_MESSAGE.to_string()));
                            }
                            next = fix_reentry_index(&template).unwrap_or(index);
                        }
                        ReviewVerdict::CapExceeded { cap } => {
                            self.store.update(id, &mut |t| {
                                t.retry_count = retry_count + 1;
                                t.metadata.set_review_findings(&findings);
                            })?;
                            return Ok(self.block(id, cap_message(cap)));
                        }
                    }
                }
                steps::GENERATE_TASKS => {
                    let specs = result.generated_tasks.unwrap_or_default();
                    if !specs.is_empty() {
                        let children = spawn_children(self.store.as_ref(), &self.bus, id, specs)?;
                        info!(task_id = %id, children = children.len(), "child tasks generated");
                    }
                }
                steps::COMMIT => {
                    let title = self.current(id)?.title;
                    match self.vcs.commit_task(id, &title).await {
                        Ok(sha) => {
                            if let Some(sha) = sha {
                                self.store
                                    .update(id, &mut |t| t.commit_sha = Some(sha.clone()))?;
                            }
                        }
                        Err(e) => return Ok(self.block(id, format!("Commit failed: {e}"))),
                    }
                }
                _ => {}
            }

            if let Some(gate) = gate_after(mode, step) {
                if !approved.contains(&gate) {
                    if let Some(outcome) = self.pass_gate(id, gate).await? {
                        return Ok(outcome);
                    }
                    approved.insert(gate);
                }
            }
            index = next;
        }

        self.complete(id)
    }

    /// Invoke the adapter for `step`, logging it on `run`.
    async fn run_step(
        &self,
        id: Uuid,
        step: &str,
        attempt: u32,
        run: &mut RunRecord,
    ) -> Result<StepRun, ExecutorError> {
        let agent_id = self.agents.route(step).map(|a| a.id);
        let snapshot = self
            .store
            .update(id, &mut |t| t.current_agent_id = agent_id)?;

        info!(task_id = %id, step, attempt, "step started");
        self.bus.emit(
            id,
            EventKind::StepStarted {
                step: step.to_string(),
            },
            format!("{step} (attempt {attempt})"),
        );

        let result = run_step_contained(self.adapter.as_ref(), &snapshot, step, attempt).await;
        let (outcome, status, summary) = match result {
            Ok(result) if result.is_ok() => {
                let summary = result.summary.clone();
                (StepRun::Ok(result), StepStatus::Ok, summary)
            }
            Ok(result) => {
                warn!(task_id = %id, step, summary = %result.summary, "step returned error");
                (StepRun::Failed, StepStatus::Error, result.summary)
            }
            Err(e) => {
                error!(task_id = %id, step, error = %e, "adapter fault");
                (StepRun::Failed, StepStatus::Error, e.to_string())
            }
        };

        run.push_step(step, status);
        self.store.save_run(run);
        self.bus.emit(
            id,
            EventKind::StepCompleted {
                step: step.to_string(),
                ok: status == StepStatus::Ok,
            },
            summary,
        );
        Ok(outcome)
    }

    /// `None` when the gate was approved, otherwise how the run ends.
    async fn pass_gate(&self, id: Uuid, gate: Gate) -> Result<Option<RunOutcome>, ExecutorError> {
        let timeout = self.gate_timeouts.timeout_for(gate);
        Ok(match self.gates.wait(id, gate, timeout).await? {
            GateOutcome::Approved => None,
            GateOutcome::Cancelled => Some(RunOutcome::Cancelled),
            outcome => outcome
                .failure_message(gate)
                .map(|reason| self.block(id, reason)),
        })
    }

    fn record_review(
        &self,
        id: Uuid,
        run: &RunRecord,
        retry_count: u32,
        findings: &[Finding],
        verdict: ReviewVerdict,
    ) {
        let approved = verdict == ReviewVerdict::Approved;
        self.store.record_review(ReviewCycle {
            id: Uuid::new_v4(),
            task_id: id,
            run_id: run.id,
            attempt: retry_count + 1,
            decision: if approved {
                ReviewDecision::Approved
            } else {
                ReviewDecision::ChangesRequested
            },
            findings: findings.to_vec(),
            recorded_at: Utc::now(),
        });
        let new_count = match verdict {
            ReviewVerdict::Approved => retry_count,
            _ => retry_count + 1,
        };
        self.bus.emit(
            id,
            EventKind::ReviewDecision {
                approved,
                retry_count: new_count,
            },
            format!("{} finding(s)", findings.len()),
        );
    }

    /// Walk `in_progress -> in_review` and, unless a human must sign off,
    /// on to `done`.
    fn complete(&self, id: Uuid) -> Result<RunOutcome, ExecutorError> {
        let task = self.store.update(id, &mut |t| {
            t.metadata.clear_approved_gates();
            t.current_agent_id = None;
        })?;
        self.store.transition(id, TaskStatus::InReview, None)?;
        self.bus.emit(id, EventKind::TaskInReview, "pipeline complete");
        if task.requires_human_review() {
            info!(task_id = %id, "awaiting human review");
            return Ok(RunOutcome::InReview);
        }
        self.store.transition(id, TaskStatus::Done, None)?;
        self.bus.emit(id, EventKind::TaskDone, "done");
        info!(task_id = %id, "task done");
        Ok(RunOutcome::Done)
    }

    /// Move `id` to `blocked` with `reason`. Never fails: a task that can no
    /// longer be blocked (e.g. cancelled meanwhile) is only logged.
    pub fn block(&self, id: Uuid, reason: String) -> RunOutcome {
        match self
            .store
            .transition(id, TaskStatus::Blocked, Some(reason.clone()))
        {
            Ok(_) => {
                warn!(task_id = %id, reason = %reason, "task blocked");
                self.bus.emit(
                    id,
                    EventKind::TaskBlocked {
                        reason: reason.clone(),
                    },
                    reason.clone(),
                );
            }
            Err(e) => {
                if self.is_cancelled(id) {
                    return RunOutcome::Cancelled;
                }
                error!(task_id = %id, reason = %reason, error = %e, "failed to block task");
            }
        }
        RunOutcome::Blocked { reason }
    }

    fn current(&self, id: Uuid) -> Result<Task, ExecutorError> {
        self.store.get(id).ok_or(ExecutorError::NotFound(id))
    }

    fn is_cancelled(&self, id: Uuid) -> bool {
        self.store
            .get(id)
            .is_some_and(|t| t.status() == TaskStatus::Cancelled)
    }
}

/// Where a run resumes after a human asked for changes: right after
/// `implement`, else at `review`, else from the top.
fn human_reentry_index(template: &[String]) -> usize {
    if let Some(implement) = template.iter().position(|s| s == steps::IMPLEMENT) {
        return implement + 1;
    }
    template
        .iter()
        .position(|s| s == steps::REVIEW)
        .unwrap_or(0)
}
