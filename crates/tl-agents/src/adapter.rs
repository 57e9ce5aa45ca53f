//! The seam between orchestration and the worker that actually performs a
//! step (a model, a CLI tool, a test double).

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tl_core::types::{
    Finding, NewTask, Priority, StepStatus, Task, TaskMetadata, TaskSource, TaskType,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter timed out after {0:?}")]
    Timeout(Duration),
    #[error("adapter process failed (exit {code:?}): {stderr}")]
    Process { code: Option<i32>, stderr: String },
    #[error("adapter protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("adapter panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A task the worker wants created, typically from a `generate_tasks` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TaskMetadata>,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            task_type: None,
            priority: None,
            metadata: None,
        }
    }

    /// Store input for a generated child.
    pub fn into_new_task(self) -> NewTask {
        let mut new = NewTask::new(self.title, self.task_type.unwrap_or_default())
            .with_source(TaskSource::Generated);
        if let Some(description) = self.description {
            new = new.with_description(description);
        }
        if let Some(priority) = self.priority {
            new = new.with_priority(priority);
        }
        if let Some(metadata) = self.metadata {
            new.metadata = metadata;
        }
        new
    }
}

/// `to` is blocked by `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: Uuid,
    pub to: Uuid,
}

/// Structured outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<Finding>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_tasks: Option<Vec<TaskSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_edges: Option<Vec<DependencyEdge>>,
}

impl StepResult {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Ok,
            summary: summary.into(),
            findings: None,
            generated_tasks: None,
            dependency_edges: None,
        }
    }

    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Error,
            ..Self::ok(summary)
        }
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = Some(findings);
        self
    }

    pub fn with_generated_tasks(mut self, specs: Vec<TaskSpec>) -> Self {
        self.generated_tasks = Some(specs);
        self
    }

    pub fn with_dependency_edges(mut self, edges: Vec<DependencyEdge>) -> Self {
        self.dependency_edges = Some(edges);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Ok
    }

    /// Findings, treating an absent list as empty.
    pub fn findings(&self) -> &[Finding] {
        self.findings.as_deref().unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// WorkerAdapter
// ---------------------------------------------------------------------------

/// Performs one pipeline step for a task.
///
/// `attempt` starts at 1 and increases with each review/fix cycle. The task
/// passed in is a snapshot; metadata such as `review_findings` carries the
/// context of previous steps.
#[async_trait::async_trait]
pub trait WorkerAdapter: Send + Sync {
    async fn run_step(&self, task: &Task, step: &str, attempt: u32)
        -> Result<StepResult, AdapterError>;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// [`WorkerAdapter::run_step`] with a panic inside the adapter turned into
/// [`AdapterError::Panicked`].
pub async fn run_step_contained(
    adapter: &dyn WorkerAdapter,
    task: &Task,
    step: &str,
    attempt: u32,
) -> Result<StepResult, AdapterError> {
    match AssertUnwindSafe(adapter.run_step(task, step, attempt))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(AdapterError::Panicked(panic_message(payload.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_result_parses_minimal_json() {
        let result: StepResult = serde_json::from_str(r#"{"status": "ok"}"#).unwrap();
        assert!(result.is_ok());
        assert!(result.findings().is_empty());
    }

    #[test]
    fn step_result_parses_full_json() {
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();
        let json = serde_json::json!({
            "status": "ok",
            "summary": "reviewed",
            "findings": ["missing test", {"message": "typo", "file": "lib.rs"}],
            "generated_tasks": [{"title": "follow up", "task_type": "chore", "priority": "P1"}],
            "dependency_edges": [{"from": from, "to": to}],
        });
        let result: StepResult = serde_json::from_value(json).unwrap();
        assert_eq!(result.findings().len(), 2);
        assert_eq!(result.findings()[1].file.as_deref(), Some("lib.rs"));
        let specs = result.generated_tasks.unwrap();
        assert_eq!(specs[0].task_type, Some(TaskType::Chore));
        assert_eq!(result.dependency_edges.unwrap(), vec![DependencyEdge { from, to }]);
    }

    struct Panicky;

    #[async_trait::async_trait]
    impl WorkerAdapter for Panicky {
        async fn run_step(
            &self,
            _task: &Task,
            step: &str,
            _attempt: u32,
        ) -> Result<StepResult, AdapterError> {
            panic!("worker exploded during {step}");
        }
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let task = Task::new("boom", TaskType::Chore);
        match run_step_contained(&Panicky, &task, "implement", 1).await {
            Err(AdapterError::Panicked(msg)) => assert!(msg.contains("implement")),
            other => panic!("expected contained panic, got {other:?}"),
        }
    }

    #[test]
    fn spec_becomes_generated_task() {
        let mut spec = TaskSpec::new("child");
        spec.priority = Some(Priority::P0);
        let new = spec.into_new_task();
        assert_eq!(new.source, TaskSource::Generated);
        assert_eq!(new.priority, Priority::P0);
        assert_eq!(new.task_type, TaskType::Feature);
    }
}
