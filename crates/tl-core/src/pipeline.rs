//! Task type to step sequence mapping.
//!
//! Each [`TaskType`] owns an immutable step table. A [`PipelineRegistry`]
//! may replace the table for a type (from configuration), and a task's own
//! `pipeline_template` always wins over both.

use std::collections::HashMap;

use crate::types::{Task, TaskType};

/// Step names the executor treats specially.
pub mod steps {
    pub const PLAN: &str = "plan";
    pub const PLAN_IMPL: &str = "plan_impl";
    pub const IMPLEMENT: &str = "implement";
    pub const IMPLEMENT_FIX: &str = "implement_fix";
    pub const VERIFY: &str = "verify";
    pub const REVIEW: &str = "review";
    pub const COMMIT: &str = "commit";
    pub const GENERATE_TASKS: &str = "generate_tasks";
    pub const ANALYZE_DEPS: &str = "analyze_deps";
}

impl TaskType {
    /// Canonical step sequence for this type.
    pub fn default_steps(&self) -> &'static [&'static str] {
        match self {
            TaskType::Feature => &["plan", "plan_impl", "implement", "verify", "review", "commit"],
            TaskType::Bug => &["reproduce", "diagnose", "implement", "verify", "review", "commit"],
            TaskType::Hotfix => &["implement", "verify", "review", "commit"],
            TaskType::Chore => &["implement", "verify", "commit"],
            TaskType::Research => &["gather", "analyze", "summarize", "report"],
            TaskType::Spike => &["gather", "prototype", "summarize", "report"],
            TaskType::PlanOnly => &["analyze", "plan", "report"],
            TaskType::Decompose => &["analyze", "plan", "generate_tasks"],
            TaskType::Security => &["scan_deps", "scan_code", "report", "generate_tasks"],
            TaskType::RepoReview => &["scan", "analyze", "generate_tasks"],
            TaskType::Review => &["analyze", "review", "report"],
            TaskType::Performance => {
                &["profile", "plan", "implement", "benchmark", "review", "commit"]
            }
            TaskType::VerifyOnly => &["verify", "report"],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    overrides: HashMap<TaskType, Vec<String>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the step table for `task_type`.
    pub fn with_override(mut self, task_type: TaskType, steps: Vec<String>) -> Self {
        self.overrides.insert(task_type, steps);
        self
    }

    pub fn set_override(&mut self, task_type: TaskType, steps: Vec<String>) {
        self.overrides.insert(task_type, steps);
    }

    pub fn steps_for(&self, task_type: TaskType) -> Vec<String> {
        match self.overrides.get(&task_type) {
            Some(steps) => steps.clone(),
            None => task_type
                .default_steps()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Steps `task` should execute. A non-empty per-task template wins.
    pub fn resolve(&self, task: &Task) -> Vec<String> {
        match &task.pipeline_template {
            Some(steps) if !steps.is_empty() => steps.clone(),
            _ => self.steps_for(task.task_type),
        }
    }
}
