//! The task index and the only place task status and dependency edges
//! change.
//!
//! [`MemoryTaskStore`] keeps every record behind one mutex. Each public
//! operation takes the lock once, validates, mutates and persists before
//! releasing it, so callers never observe a half-applied change. The lock is
//! never held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fsm::{self, TransitionError};
use crate::persistence::{NullPersistence, Persistence, PersistenceError};
use crate::types::{
    AgentRecord, NewTask, ReviewCycle, RunRecord, RunStatus, Task, TaskSource, TaskStatus,
    TaskType,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("field `{0}` is owned by the store and cannot be written directly")]
    ProtectedField(&'static str),
    #[error("task {0} is terminal; only metadata may change")]
    Terminal(Uuid),
    #[error("task {0} cannot depend on itself")]
    SelfDependency(Uuid),
    #[error("dependency {blocker} -> {dependent} would create a cycle")]
    Cycle { blocker: Uuid, dependent: Uuid },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// TaskFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub parent_id: Option<Uuid>,
    pub source: Option<TaskSource>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn children_of(parent_id: Uuid) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.task_type.is_none_or(|t| task.task_type == t)
            && self.parent_id.is_none_or(|p| task.parent_id == Some(p))
            && self.source.is_none_or(|s| task.source == s)
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Store interface consumed by the executor and the orchestrator.
///
/// Every method is atomic with respect to every other method.
pub trait TaskStore: Send + Sync {
    /// Insert a new task in `backlog`.
    fn create(&self, new: NewTask) -> Result<Task>;

    /// Insert `task` if its id is unknown (normalised to a fresh `backlog`
    /// task), otherwise replace its caller-owned fields. Store-owned fields
    /// on the incoming value are ignored.
    fn upsert(&self, task: Task) -> Result<Task>;

    fn get(&self, id: Uuid) -> Option<Task>;

    /// Matching tasks in creation order.
    fn list(&self, filter: &TaskFilter) -> Vec<Task>;

    /// Read-modify-write under the store lock. The closure may not touch
    /// store-owned fields, and on a terminal task it may only touch metadata.
    fn update(&self, id: Uuid, f: &mut dyn FnMut(&mut Task)) -> Result<Task>;

    /// Move `id` to `to` through the FSM. `reason` becomes the task's
    /// `error` when `to` is `blocked`.
    fn transition(&self, id: Uuid, to: TaskStatus, reason: Option<String>) -> Result<Task>;

    /// `ready -> in_progress` for direct invocation (no concurrency cap).
    fn start(&self, id: Uuid) -> Result<Task>;

    /// Atomically select and mark `in_progress` the best runnable task.
    fn claim_next_runnable(
        &self,
        max_in_progress: usize,
        repo_conflicts: &HashSet<String>,
    ) -> Option<Task>;

    fn count_in_progress(&self) -> usize;

    /// Record that `dependent` waits on `blocker`. Both directions are
    /// written together or not at all.
    fn add_dependency(&self, blocker: Uuid, dependent: Uuid) -> Result<()>;

    fn remove_dependency(&self, blocker: Uuid, dependent: Uuid) -> Result<()>;

    /// Create a task linked under `parent_id`.
    fn create_child(&self, parent_id: Uuid, new: NewTask) -> Result<Task>;

    /// Return every `in_progress` task to `ready` and mark its running
    /// RunRecords `interrupted`. Used once at startup.
    fn recover_interrupted(&self) -> Vec<Uuid>;

    fn save_run(&self, run: &RunRecord);
    fn runs_for(&self, task_id: Uuid) -> Vec<RunRecord>;

    fn record_review(&self, cycle: ReviewCycle);
    fn review_cycles(&self, task_id: Uuid) -> Vec<ReviewCycle>;

    fn upsert_agent(&self, agent: AgentRecord);
    fn agents(&self) -> Vec<AgentRecord>;
}

// ---------------------------------------------------------------------------
// MemoryTaskStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Index {
    tasks: HashMap<Uuid, Task>,
    next_seq: u64,
    runs: HashMap<Uuid, RunRecord>,
    reviews: Vec<ReviewCycle>,
    agents: HashMap<Uuid, AgentRecord>,
}

impl Index {
    fn status_of(&self, id: &Uuid) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    fn task(&self, id: Uuid) -> Result<&Task> {
        self.tasks.get(&id).ok_or(StoreError::NotFound(id))
    }

    fn task_mut(&mut self, id: Uuid) -> Result<&mut Task> {
        self.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn insert_new(&mut self, mut task: Task) -> Task {
        self.next_seq += 1;
        task.created_seq = self.next_seq;
        task.status = TaskStatus::Backlog;
        task.blocked_by.clear();
        task.blocks.clear();
        task.children_ids.clear();
        self.tasks.insert(task.id, task.clone());
        task
    }

    fn blockers_resolved(&self, task: &Task) -> bool {
        fsm::unresolved_blockers(task, |id| self.status_of(id)).is_empty()
    }

    /// Is `target` reachable from `start` by following `blocks` edges?
    fn reaches(&self, start: Uuid, target: Uuid) -> bool {
        let mut stack = vec![start];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(&id) {
                stack.extend(task.blocks.iter().copied());
            }
        }
        false
    }
}

/// In-memory task index with a pluggable [`Persistence`] backend.
pub struct MemoryTaskStore {
    inner: Mutex<Index>,
    persistence: Box<dyn Persistence>,
}

impl MemoryTaskStore {
    /// A store that keeps nothing on disk.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Index::default()),
            persistence: Box::new(NullPersistence),
        }
    }

    /// Open a store over `persistence`, reloading every saved record.
    pub fn open(persistence: Box<dyn Persistence>) -> std::result::Result<Self, PersistenceError> {
        let state = persistence.load()?;
        let mut index = Index::default();
        for task in state.tasks {
            index.next_seq = index.next_seq.max(task.created_seq);
            index.tasks.insert(task.id, task);
        }
        for run in state.runs {
            index.runs.insert(run.id, run);
        }
        index.reviews = state.reviews;
        for agent in state.agents {
            index.agents.insert(agent.id, agent);
        }
        info!(tasks = index.tasks.len(), runs = index.runs.len(), "task store loaded");
        Ok(Self {
            inner: Mutex::new(index),
            persistence,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_task(&self, task: &Task) {
        if let Err(e) = self.persistence.save_task(task) {
            warn!(task_id = %task.id, error = %e, "failed to persist task");
        }
    }

    fn persist_run(&self, run: &RunRecord) {
        if let Err(e) = self.persistence.save_run(run) {
            warn!(run_id = %run.id, error = %e, "failed to persist run record");
        }
    }

    fn transition_locked(
        &self,
        index: &mut Index,
        id: Uuid,
        to: TaskStatus,
        reason: Option<String>,
    ) -> Result<Task> {
        let task = index.task(id)?;
        fsm::validate(task, to, |bid| index.status_of(bid))?;

        let from = task.status;
        let now = Utc::now();
        let task = index.task_mut(id)?;
        task.status = to;
        task.updated_at = now;
        match to {
            TaskStatus::Blocked => {
                task.error = reason;
                task.pending_gate = None;
                task.current_agent_id = None;
            }
            TaskStatus::Ready | TaskStatus::InProgress => {
                if from == TaskStatus::Blocked {
                    task.error = None;
                }
            }
            TaskStatus::Done => {
                task.completed_at = Some(now);
                task.pending_gate = None;
                task.current_agent_id = None;
            }
            TaskStatus::Cancelled => {
                task.pending_gate = None;
                task.current_agent_id = None;
                if reason.is_some() {
                    task.error = reason;
                }
            }
            TaskStatus::Backlog | TaskStatus::InReview => {}
        }
        let task = task.clone();
        self.persist_task(&task);
        debug!(task_id = %id, from = %from, to = %to, "task transition");
        Ok(task)
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject writes to store-owned fields.
fn check_protected(before: &Task, after: &Task) -> Result<()> {
    if before.id != after.id {
        return Err(StoreError::ProtectedField("id"));
    }
    if before.status != after.status {
        return Err(StoreError::ProtectedField("status"));
    }
    if before.blocked_by != after.blocked_by {
        return Err(StoreError::ProtectedField("blocked_by"));
    }
    if before.blocks != after.blocks {
        return Err(StoreError::ProtectedField("blocks"));
    }
    if before.parent_id != after.parent_id {
        return Err(StoreError::ProtectedField("parent_id"));
    }
    if before.children_ids != after.children_ids {
        return Err(StoreError::ProtectedField("children_ids"));
    }
    if before.created_seq != after.created_seq {
        return Err(StoreError::ProtectedField("created_seq"));
    }
    Ok(())
}

impl TaskStore for MemoryTaskStore {
    fn create(&self, new: NewTask) -> Result<Task> {
        let task = {
            let mut index = self.lock();
            let task = index.insert_new(new.into_task());
            self.persist_task(&task);
            task
        };
        info!(task_id = %task.id, task_type = %task.task_type, title = %task.title, "task created");
        Ok(task)
    }

    fn upsert(&self, task: Task) -> Result<Task> {
        let mut index = self.lock();
        let id = task.id;
        let Some(existing) = index.tasks.get(&id).cloned() else {
            let mut fresh = task;
            fresh.parent_id = None;
            let fresh = index.insert_new(fresh);
            self.persist_task(&fresh);
            return Ok(fresh);
        };

        let mut incoming = task;
        incoming.status = existing.status;
        incoming.blocked_by = existing.blocked_by.clone();
        incoming.blocks = existing.blocks.clone();
        incoming.parent_id = existing.parent_id;
        incoming.children_ids = existing.children_ids.clone();
        incoming.created_seq = existing.created_seq;
        incoming.created_at = existing.created_at;

        if existing.status.is_terminal() {
            let mut comparable = existing.clone();
            comparable.metadata = incoming.metadata.clone();
            comparable.updated_at = incoming.updated_at;
            if comparable != incoming {
                return Err(StoreError::Terminal(id));
            }
        }

        incoming.updated_at = Utc::now();
        index.tasks.insert(id, incoming.clone());
        self.persist_task(&incoming);
        Ok(incoming)
    }

    fn get(&self, id: Uuid) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let index = self.lock();
        let mut tasks: Vec<Task> = index
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_seq);
        tasks
    }

    fn update(&self, id: Uuid, f: &mut dyn FnMut(&mut Task)) -> Result<Task> {
        let mut index = self.lock();
        let current = index.task(id)?.clone();
        let mut draft = current.clone();
        f(&mut draft);

        check_protected(&current, &draft)?;
        if current.status.is_terminal() {
            let mut comparable = current.clone();
            comparable.metadata = draft.metadata.clone();
            if comparable != draft {
                return Err(StoreError::Terminal(id));
            }
        }

        draft.updated_at = Utc::now();
        index.tasks.insert(id, draft.clone());
        self.persist_task(&draft);
        Ok(draft)
    }

    fn transition(&self, id: Uuid, to: TaskStatus, reason: Option<String>) -> Result<Task> {
        let mut index = self.lock();
        self.transition_locked(&mut index, id, to, reason)
    }

    fn start(&self, id: Uuid) -> Result<Task> {
        let mut index = self.lock();
        self.transition_locked(&mut index, id, TaskStatus::InProgress, None)
    }

    fn claim_next_runnable(
        &self,
        max_in_progress: usize,
        repo_conflicts: &HashSet<String>,
    ) -> Option<Task> {
        let mut index = self.lock();

        let in_progress: Vec<&Task> = index
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect();
        if in_progress.len() >= max_in_progress {
            return None;
        }

        let held: HashSet<&str> = in_progress
            .iter()
            .filter_map(|t| t.repo_path())
            .chain(repo_conflicts.iter().map(String::as_str))
            .collect();

        let winner = index
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready)
            .filter(|t| index.blockers_resolved(t))
            .filter(|t| t.repo_path().is_none_or(|p| !held.contains(p)))
            .min_by_key(|t| (t.priority, t.created_seq))
            .map(|t| t.id)?;

        let task = index.tasks.get_mut(&winner)?;
        task.status = TaskStatus::InProgress;
        task.updated_at = Utc::now();
        let claimed = task.clone();
        self.persist_task(&claimed);
        info!(
            task_id = %claimed.id,
            priority = ?claimed.priority,
            repo_path = claimed.repo_path().unwrap_or("-"),
            "task claimed"
        );
        Some(claimed)
    }

    fn count_in_progress(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count()
    }

    fn add_dependency(&self, blocker: Uuid, dependent: Uuid) -> Result<()> {
        if blocker == dependent {
            return Err(StoreError::SelfDependency(blocker));
        }
        let mut index = self.lock();
        index.task(blocker)?;
        let dep = index.task(dependent)?;
        if dep.status.is_terminal() {
            return Err(StoreError::Terminal(dependent));
        }
        if dep.blocked_by.contains(&blocker) {
            return Ok(());
        }
        if index.reaches(dependent, blocker) {
            return Err(StoreError::Cycle { blocker, dependent });
        }

        let now = Utc::now();
        let dep = index.task_mut(dependent)?;
        dep.blocked_by.push(blocker);
        dep.updated_at = now;
        let dep = dep.clone();
        let blk = index.task_mut(blocker)?;
        blk.blocks.push(dependent);
        blk.updated_at = now;
        let blk = blk.clone();

        self.persist_task(&dep);
        self.persist_task(&blk);
        debug!(blocker = %blocker, dependent = %dependent, "dependency added");
        Ok(())
    }

    fn remove_dependency(&self, blocker: Uuid, dependent: Uuid) -> Result<()> {
        let mut index = self.lock();
        index.task(blocker)?;
        index.task(dependent)?;

        let now = Utc::now();
        let dep = index.task_mut(dependent)?;
        dep.blocked_by.retain(|id| *id != blocker);
        dep.updated_at = now;
        let dep = dep.clone();
        let blk = index.task_mut(blocker)?;
        blk.blocks.retain(|id| *id != dependent);
        blk.updated_at = now;
        let blk = blk.clone();

        self.persist_task(&dep);
        self.persist_task(&blk);
        Ok(())
    }

    fn create_child(&self, parent_id: Uuid, new: NewTask) -> Result<Task> {
        let mut index = self.lock();
        if index.task(parent_id)?.status.is_terminal() {
            return Err(StoreError::Terminal(parent_id));
        }

        let mut child = new.into_task();
        child.parent_id = Some(parent_id);
        let child = index.insert_new(child);

        let parent = index.task_mut(parent_id)?;
        parent.children_ids.push(child.id);
        parent.updated_at = Utc::now();
        let parent = parent.clone();

        self.persist_task(&child);
        self.persist_task(&parent);
        info!(task_id = %child.id, parent_id = %parent_id, "child task created");
        Ok(child)
    }

    fn recover_interrupted(&self) -> Vec<Uuid> {
        let mut index = self.lock();
        let now = Utc::now();

        let stale: Vec<Uuid> = index
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id)
            .collect();

        for id in &stale {
            if let Some(task) = index.tasks.get_mut(id) {
                task.status = TaskStatus::Ready;
                task.pending_gate = None;
                task.current_agent_id = None;
                task.updated_at = now;
                let task = task.clone();
                self.persist_task(&task);
            }
            warn!(task_id = %id, "recovered task left in_progress by a previous process");
        }

        let interrupted: Vec<RunRecord> = index
            .runs
            .values_mut()
            .filter(|r| r.status == RunStatus::Running)
            .map(|r| {
                r.finish(RunStatus::Interrupted);
                r.clone()
            })
            .collect();
        for run in &interrupted {
            self.persist_run(run);
        }

        stale
    }

    fn save_run(&self, run: &RunRecord) {
        let mut index = self.lock();
        index.runs.insert(run.id, run.clone());
        self.persist_run(run);
    }

    fn runs_for(&self, task_id: Uuid) -> Vec<RunRecord> {
        let index = self.lock();
        let mut runs: Vec<RunRecord> = index
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    fn record_review(&self, cycle: ReviewCycle) {
        let mut index = self.lock();
        if let Err(e) = self.persistence.append_review(&cycle) {
            warn!(task_id = %cycle.task_id, error = %e, "failed to persist review cycle");
        }
        index.reviews.push(cycle);
    }

    fn review_cycles(&self, task_id: Uuid) -> Vec<ReviewCycle> {
        self.lock()
            .reviews
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect()
    }

    fn upsert_agent(&self, agent: AgentRecord) {
        let mut index = self.lock();
        if let Err(e) = self.persistence.save_agent(&agent) {
            warn!(agent_id = %agent.id, error = %e, "failed to persist agent");
        }
        index.agents.insert(agent.id, agent);
    }

    fn agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.lock().agents.values().cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        agents
    }
}
