use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tl_agents::adapter::{AdapterError, StepResult, WorkerAdapter};
use tl_agents::executor::{PipelineExecutor, INTERNAL_ERROR_MESSAGE};
use tl_bridge::event_bus::EventBus;
use tl_bridge::protocol::EventKind;
use tl_core::config::OrchestratorConfig;
use tl_core::persistence::JsonFilePersistence;
use tl_core::pipeline::steps;
use tl_core::store::{MemoryTaskStore, TaskFilter, TaskStore};
use tl_core::types::{HitlMode, NewTask, RunRecord, RunStatus, Task, TaskStatus, TaskType};
use tl_daemon::orchestrator::{Orchestrator, OrchestratorError, OrchestratorState};
use tl_daemon::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Test worker
// ---------------------------------------------------------------------------

/// Sleeps on every step and tracks how many runs overlap, globally and per
/// repo. Tasks titled `boom` panic inside the worker.
struct SlowWorker {
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    repos: Mutex<HashMap<String, usize>>,
    repo_peak: AtomicUsize,
}

impl SlowWorker {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            repos: Mutex::new(HashMap::new()),
            repo_peak: AtomicUsize::new(0),
        }
    }

    fn enter(&self, repo: Option<&str>) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(repo) = repo {
            let mut repos = self.repos.lock().unwrap();
            let count = repos.entry(repo.to_string()).or_insert(0);
            *count += 1;
            self.repo_peak.fetch_max(*count, Ordering::SeqCst);
        }
    }

    fn leave(&self, repo: Option<&str>) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(repo) = repo {
            if let Some(count) = self.repos.lock().unwrap().get_mut(repo) {
                *count -= 1;
            }
        }
    }
}

#[async_trait::async_trait]
impl WorkerAdapter for SlowWorker {
    async fn run_step(
        &self,
        task: &Task,
        step: &str,
        _attempt: u32,
    ) -> Result<StepResult, AdapterError> {
        if task.title == "boom" {
            panic!("worker crashed");
        }
        self.enter(task.repo_path());
        tokio::time::sleep(self.delay).await;
        self.leave(task.repo_path());
        Ok(StepResult::ok(step))
    }
}

fn config(concurrency: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        concurrency,
        poll_interval_ms: 5,
        max_review_attempts: None,
        analyze_dependencies: false,
    }
}

fn orchestrator(
    store: Arc<dyn TaskStore>,
    worker: Arc<SlowWorker>,
    concurrency: usize,
) -> Arc<Orchestrator> {
    let executor = PipelineExecutor::new(store, worker, EventBus::new());
    Arc::new(Orchestrator::new(Arc::new(executor), &config(concurrency)))
}

fn ready_chore(orch: &Orchestrator, title: &str, repo: Option<&str>) -> Task {
    let mut new = NewTask::new(title, TaskType::Chore);
    if let Some(repo) = repo {
        new = new.with_repo_path(repo);
    }
    orch.create_task(new, true).unwrap()
}

async fn run_until_idle(orch: &Orchestrator) {
    tokio::time::timeout(Duration::from_secs(20), orch.run(ShutdownSignal::new(), true))
        .await
        .expect("orchestrator did not go idle");
}

fn status(orch: &Orchestrator, task: &Task) -> TaskStatus {
    orch.store().get(task.id).unwrap().status()
}

async fn wait_for_gate(orch: &Orchestrator, task: &Task) {
    let keeper = orch.executor().gate_keeper().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while keeper.waiting_on(task.id).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("gate never became pending");
}

/// Tick until something is dispatched.
async fn tick_until_claim(orch: &Orchestrator) -> uuid::Uuid {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(id) = orch.tick().await {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("nothing was claimed")
}

fn gated_chore(orch: &Orchestrator) -> Task {
    orch.create_task(
        NewTask::new("gated", TaskType::Chore).with_hitl_mode(HitlMode::Supervised),
        true,
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Scheduling properties
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ticks_claim_single_task_once() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store, Arc::new(SlowWorker::new(Duration::from_millis(50))), 8);
    ready_chore(&orch, "only", None);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.tick().await })
        })
        .collect();
    let mut claimed = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 1);
    assert_eq!(orch.in_flight_count(), 1);
    orch.wait_idle().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_progress_never_exceeds_cap() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = Arc::new(SlowWorker::new(Duration::from_millis(15)));
    let orch = orchestrator(store.clone(), worker.clone(), 2);
    let tasks: Vec<Task> = (0..6)
        .map(|i| ready_chore(&orch, &format!("task {i}"), None))
        .collect();

    let sampler = tokio::spawn({
        let store = store.clone();
        async move {
            let mut max_seen = 0;
            for _ in 0..200 {
                max_seen = max_seen.max(store.count_in_progress());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            max_seen
        }
    });

    run_until_idle(&orch).await;

    assert!(sampler.await.unwrap() <= 2);
    assert!(worker.peak.load(Ordering::SeqCst) <= 2);
    for task in &tasks {
        assert_eq!(status(&orch, task), TaskStatus::Done);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tasks_sharing_repo_never_overlap() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = Arc::new(SlowWorker::new(Duration::from_millis(10)));
    let orch = orchestrator(store, worker.clone(), 4);
    let shared: Vec<Task> = (0..3)
        .map(|i| ready_chore(&orch, &format!("shared {i}"), Some("/repos/app")))
        .collect();
    let other = ready_chore(&orch, "other", Some("/repos/lib"));

    run_until_idle(&orch).await;

    assert_eq!(worker.repo_peak.load(Ordering::SeqCst), 1);
    for task in shared.iter().chain(std::iter::once(&other)) {
        assert_eq!(status(&orch, task), TaskStatus::Done);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_crash_is_contained_and_loop_continues() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store, Arc::new(SlowWorker::new(Duration::from_millis(1))), 2);
    let boom = ready_chore(&orch, "boom", None);
    let fine: Vec<Task> = (0..3)
        .map(|i| ready_chore(&orch, &format!("fine {i}"), None))
        .collect();

    run_until_idle(&orch).await;

    let boom = orch.store().get(boom.id).unwrap();
    assert_eq!(boom.status(), TaskStatus::Blocked);
    assert_eq!(boom.error.as_deref(), Some(INTERNAL_ERROR_MESSAGE));
    for task in &fine {
        assert_eq!(status(&orch, task), TaskStatus::Done);
    }
}

// ---------------------------------------------------------------------------
// Drain / recovery
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_lets_in_flight_finish_then_pauses() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store, Arc::new(SlowWorker::new(Duration::from_millis(20))), 1);
    let first = ready_chore(&orch, "first", None);
    let second = ready_chore(&orch, "second", None);

    assert_eq!(orch.tick().await, Some(first.id));
    orch.drain();
    assert_eq!(orch.state(), OrchestratorState::Draining);
    assert_eq!(orch.tick().await, None);

    orch.wait_idle().await;
    assert_eq!(orch.tick().await, None);
    assert_eq!(orch.state(), OrchestratorState::Paused);
    assert_eq!(status(&orch, &first), TaskStatus::Done);
    assert_eq!(status(&orch, &second), TaskStatus::Ready);

    orch.resume();
    assert_eq!(orch.tick().await, Some(second.id));
    orch.wait_idle().await;
    assert_eq!(status(&orch, &second), TaskStatus::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_in_flight_runs() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store, Arc::new(SlowWorker::new(Duration::from_millis(30))), 1);
    let task = ready_chore(&orch, "slow", None);
    let shutdown = ShutdownSignal::new();

    let run = tokio::spawn({
        let orch = orch.clone();
        let shutdown = shutdown.clone();
        async move { orch.run(shutdown, false).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while orch.in_flight_count() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    shutdown.trigger();

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status(&orch, &task), TaskStatus::Done);
    assert_eq!(orch.state(), OrchestratorState::Paused);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_recovers_interrupted_task() {
    let dir = tempfile::tempdir().unwrap();
    let stranded = {
        let store =
            MemoryTaskStore::open(Box::new(JsonFilePersistence::new(dir.path()).unwrap())).unwrap();
        let task = store.create(NewTask::new("stranded", TaskType::Chore)).unwrap();
        store.transition(task.id, TaskStatus::Ready, None).unwrap();
        store.start(task.id).unwrap();
        store.save_run(&RunRecord::start(task.id));
        task
    };

    let store: Arc<dyn TaskStore> = Arc::new(
        MemoryTaskStore::open(Box::new(JsonFilePersistence::new(dir.path()).unwrap())).unwrap(),
    );
    let orch = orchestrator(store.clone(), Arc::new(SlowWorker::new(Duration::from_millis(1))), 2);
    let events = orch.executor().bus().subscribe();

    assert_eq!(orch.recover(), vec![stranded.id]);
    assert_eq!(status(&orch, &stranded), TaskStatus::Ready);
    assert_eq!(store.runs_for(stranded.id)[0].status, RunStatus::Interrupted);
    assert!(events
        .drain()
        .any(|e| e.task_id == stranded.id && e.kind == EventKind::TaskRecovered));

    run_until_idle(&orch).await;
    assert_eq!(status(&orch, &stranded), TaskStatus::Done);
    assert!(store
        .list(&TaskFilter::with_status(TaskStatus::InProgress))
        .is_empty());
}

// ---------------------------------------------------------------------------
// Operator surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gate_signal_without_pending_gate_is_rejected() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store, Arc::new(SlowWorker::new(Duration::ZERO)), 1);
    let task = ready_chore(&orch, "plain", None);

    assert!(matches!(
        orch.approve_gate(task.id, "before_commit"),
        Err(OrchestratorError::Gate(_))
    ));
    assert!(matches!(
        orch.approve_gate(task.id, "whenever"),
        Err(OrchestratorError::Gate(_))
    ));
}

#[tokio::test]
async fn create_task_can_leave_task_in_backlog() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store, Arc::new(SlowWorker::new(Duration::ZERO)), 1);
    let task = orch
        .create_task(NewTask::new("later", TaskType::Chore), false)
        .unwrap();

    assert_eq!(task.status(), TaskStatus::Backlog);
    assert_eq!(orch.tick().await, None);
}

// ---------------------------------------------------------------------------
// Cancellation / background work
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_gated_task_frees_its_slot() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store, Arc::new(SlowWorker::new(Duration::ZERO)), 1);
    let gated = gated_chore(&orch);
    assert_eq!(orch.tick().await, Some(gated.id));
    wait_for_gate(&orch, &gated).await;

    let next = ready_chore(&orch, "next", None);
    assert_eq!(orch.tick().await, None);

    let cancelled = orch
        .cancel_task(gated.id, Some("no longer needed".into()))
        .unwrap();
    assert_eq!(cancelled.status(), TaskStatus::Cancelled);

    assert_eq!(tick_until_claim(&orch).await, next.id);
    let runs = orch.store().runs_for(gated.id);
    assert_eq!(runs.last().unwrap().status, RunStatus::Interrupted);
    assert_eq!(orch.store().get(gated.id).unwrap().pending_gate, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_through_store_releases_gated_run() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store.clone(), Arc::new(SlowWorker::new(Duration::ZERO)), 1);
    let gated = gated_chore(&orch);
    assert_eq!(orch.tick().await, Some(gated.id));
    wait_for_gate(&orch, &gated).await;

    store
        .transition(gated.id, TaskStatus::Cancelled, None)
        .unwrap();
    let next = ready_chore(&orch, "next", None);

    assert_eq!(tick_until_claim(&orch).await, next.id);
    assert_eq!(status(&orch, &gated), TaskStatus::Cancelled);
}

/// Answers instantly except for dependency analysis, which is slow.
struct SlowAnalysis;

#[async_trait::async_trait]
impl WorkerAdapter for SlowAnalysis {
    async fn run_step(
        &self,
        _task: &Task,
        step: &str,
        _attempt: u32,
    ) -> Result<StepResult, AdapterError> {
        if step == steps::ANALYZE_DEPS {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(StepResult::ok(step))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_dependency_analysis_does_not_delay_claims() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let executor = PipelineExecutor::new(store, Arc::new(SlowAnalysis), EventBus::new());
    let mut cfg = config(2);
    cfg.analyze_dependencies = true;
    let orch = Orchestrator::new(Arc::new(executor), &cfg);

    for title in ["schema", "api", "docs"] {
        orch.create_task(NewTask::new(title, TaskType::Chore), false)
            .unwrap();
    }
    let ready = ready_chore(&orch, "ready", None);

    let started = Instant::now();
    assert_eq!(orch.tick().await, Some(ready.id));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_blocker_announces_unblocked_dependent() {
    let store = Arc::new(MemoryTaskStore::new());
    let orch = orchestrator(store.clone(), Arc::new(SlowWorker::new(Duration::ZERO)), 1);
    let events = orch.executor().bus().subscribe();

    let blocker = ready_chore(&orch, "schema", None);
    let dependent = orch
        .create_task(NewTask::new("api", TaskType::Chore), false)
        .unwrap();
    store.add_dependency(blocker.id, dependent.id).unwrap();

    run_until_idle(&orch).await;

    assert_eq!(status(&orch, &blocker), TaskStatus::Done);
    let unblocked: Vec<_> = events
        .drain()
        .filter_map(|e| match e.kind {
            EventKind::TaskUnblocked { blocker } => Some((e.task_id, blocker)),
            _ => None,
        })
        .collect();
    assert_eq!(unblocked, vec![(dependent.id, blocker.id)]);
}
