use std::sync::Arc;

use thiserror::Error;
use tl_agents::adapter::WorkerAdapter;
use tl_agents::command_adapter::CommandAdapter;
use tl_agents::executor::PipelineExecutor;
use tl_agents::vcs::{GitCliVcs, SessionVcs};
use tl_bridge::event_bus::EventBus;
use tl_core::config::{Config, ConfigError};
use tl_core::persistence::{JsonFilePersistence, PersistenceError};
use tl_core::store::{MemoryTaskStore, TaskStore};
use tracing::{debug, info};

use crate::orchestrator::Orchestrator;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open task store: {0}")]
    Persistence(#[from] PersistenceError),
}

/// The taskloom background daemon: one orchestrator loop over one store.
///
/// Shuts down gracefully when the [`ShutdownSignal`] is triggered (e.g. via
/// ctrl-c): claiming stops and in-flight runs are allowed to finish.
pub struct Daemon {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    shutdown: ShutdownSignal,
    event_bus: EventBus,
}

impl Daemon {
    /// Build from config: JSON-file store (or in-memory when `store.path` is
    /// empty), command-line worker adapter, optional git integration.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        let store: Arc<dyn TaskStore> = match config.store.resolved_path() {
            Some(path) => {
                info!(path = %path.display(), "opening task store");
                Arc::new(MemoryTaskStore::open(Box::new(JsonFilePersistence::new(path)?))?)
            }
            None => {
                info!("store.path is empty, tasks are kept in memory only");
                Arc::new(MemoryTaskStore::new())
            }
        };
        let adapter = Arc::new(CommandAdapter::from_config(&config.adapter));
        Ok(Self::with_parts(config, store, adapter))
    }

    /// Build around an existing store and worker adapter.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn TaskStore>,
        adapter: Arc<dyn WorkerAdapter>,
    ) -> Self {
        let event_bus = EventBus::new();
        let vcs = if config.vcs.enabled {
            let git = GitCliVcs::new(config.vcs.resolved_repo_path(), &config.vcs.branch_prefix);
            info!(repo = %git.repo_path().display(), branch = %git.branch(), "git integration enabled");
            SessionVcs::new(Arc::new(git))
        } else {
            SessionVcs::disabled()
        };

        let executor = PipelineExecutor::new(store, adapter, event_bus.clone())
            .with_pipelines(config.pipeline_registry())
            .with_max_review_attempts(config.orchestrator.max_review_attempts)
            .with_gate_timeouts(config.gates.clone())
            .with_vcs(Arc::new(vcs));
        executor.agents().ensure_defaults();

        let orchestrator = Arc::new(Orchestrator::new(Arc::new(executor), &config.orchestrator));
        Self {
            config,
            orchestrator,
            shutdown: ShutdownSignal::new(),
            event_bus,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Recover interrupted tasks, then run the loop until shutdown (or until
    /// idle when `exit_when_idle`).
    pub async fn run(&self, exit_when_idle: bool) {
        self.orchestrator.recover();

        let events = self.event_bus.subscribe();
        let event_log = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                debug!(task_id = %event.task_id, event = event.kind.name(), message = %event.message, "lifecycle event");
            }
        });

        self.orchestrator
            .run(self.shutdown.clone(), exit_when_idle)
            .await;

        event_log.abort();
        info!("daemon stopped");
    }
}
