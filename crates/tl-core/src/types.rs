use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gates::Gate;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    InProgress,
    InReview,
    Blocked,
    Done,
    Cancelled,
}

impl TaskStatus {
    /// `done` and `cancelled` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// Closed set of task types. Unknown names resolve to [`TaskType::Feature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum TaskType {
    Feature,
    Bug,
    Research,
    Security,
    RepoReview,
    Review,
    Performance,
    Hotfix,
    Spike,
    Chore,
    PlanOnly,
    Decompose,
    VerifyOnly,
}

impl TaskType {
    pub const ALL: [TaskType; 13] = [
        TaskType::Feature,
        TaskType::Bug,
        TaskType::Research,
        TaskType::Security,
        TaskType::RepoReview,
        TaskType::Review,
        TaskType::Performance,
        TaskType::Hotfix,
        TaskType::Spike,
        TaskType::Chore,
        TaskType::PlanOnly,
        TaskType::Decompose,
        TaskType::VerifyOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Feature => "feature",
            TaskType::Bug => "bug",
            TaskType::Research => "research",
            TaskType::Security => "security",
            TaskType::RepoReview => "repo_review",
            TaskType::Review => "review",
            TaskType::Performance => "performance",
            TaskType::Hotfix => "hotfix",
            TaskType::Spike => "spike",
            TaskType::Chore => "chore",
            TaskType::PlanOnly => "plan_only",
            TaskType::Decompose => "decompose",
            TaskType::VerifyOnly => "verify_only",
        }
    }

    /// Exact lookup; `None` for names outside the closed set.
    pub fn from_known(name: &str) -> Option<TaskType> {
        let name = name.trim().to_ascii_lowercase();
        TaskType::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    /// Lenient lookup used for task input: unknown names become `feature`.
    pub fn parse(name: &str) -> TaskType {
        TaskType::from_known(name).unwrap_or(TaskType::Feature)
    }
}

impl Default for TaskType {
    fn default() -> Self {
        TaskType::Feature
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        TaskType::parse(&value)
    }
}

impl FromStr for TaskType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskType::parse(s))
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// P0 is the most urgent; the derived ordering sorts P0 first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P2
    }
}

// ---------------------------------------------------------------------------
// Approval / HITL modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    AutoApprove,
    HumanReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlMode {
    Autopilot,
    Supervised,
    ReviewOnly,
    Collaborative,
}

impl From<ApprovalMode> for HitlMode {
    fn from(mode: ApprovalMode) -> Self {
        match mode {
            ApprovalMode::AutoApprove => HitlMode::Autopilot,
            ApprovalMode::HumanReview => HitlMode::ReviewOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Manual,
    Generated,
    PromotedQuickAction,
    Import,
}

impl Default for TaskSource {
    fn default() -> Self {
        TaskSource::Manual
    }
}

// ---------------------------------------------------------------------------
// Finding
// ---------------------------------------------------------------------------

/// One review finding. Accepts either a bare string or a structured object
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FindingRepr")]
pub struct Finding {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Finding {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: None,
            file: None,
            line: None,
        }
    }
}

impl From<&str> for Finding {
    fn from(message: &str) -> Self {
        Finding::new(message)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FindingRepr {
    Text(String),
    Full {
        message: String,
        #[serde(default)]
        severity: Option<String>,
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        line: Option<u32>,
    },
}

impl From<FindingRepr> for Finding {
    fn from(repr: FindingRepr) -> Self {
        match repr {
            FindingRepr::Text(message) => Finding::new(message),
            FindingRepr::Full {
                message,
                severity,
                file,
                line,
            } => Finding {
                message,
                severity,
                file,
                line,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// TaskMetadata
// ---------------------------------------------------------------------------

/// Well-known metadata keys.
pub mod keys {
    pub const REPO_PATH: &str = "repo_path";
    pub const REVIEW_FINDINGS: &str = "review_findings";
    pub const REQUESTED_CHANGES: &str = "requested_changes";
    pub const PROVIDER_OVERRIDE: &str = "provider_override";
    pub const DEPS_ANALYZED: &str = "deps_analyzed";
    pub const INFERRED_DEPS: &str = "inferred_deps";
    pub const APPROVED_GATES: &str = "approved_gates";
    pub const ANALYSIS_PEERS: &str = "analysis_peers";
}

/// Per-task side-table for cross-step context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskMetadata(BTreeMap<String, serde_json::Value>);

impl TaskMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    pub fn repo_path(&self) -> Option<&str> {
        self.get_str(keys::REPO_PATH)
    }

    pub fn set_repo_path(&mut self, path: impl Into<String>) {
        self.insert(keys::REPO_PATH, serde_json::Value::String(path.into()));
    }

    pub fn provider_override(&self) -> Option<&str> {
        self.get_str(keys::PROVIDER_OVERRIDE)
    }

    pub fn review_findings(&self) -> Vec<Finding> {
        self.0
            .get(keys::REVIEW_FINDINGS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_review_findings(&mut self, findings: &[Finding]) {
        let value = serde_json::to_value(findings).unwrap_or(serde_json::Value::Null);
        self.insert(keys::REVIEW_FINDINGS, value);
    }

    pub fn clear_review_findings(&mut self) {
        self.remove(keys::REVIEW_FINDINGS);
    }

    pub fn requested_changes(&self) -> Option<&str> {
        self.get_str(keys::REQUESTED_CHANGES)
    }

    pub fn set_requested_changes(&mut self, changes: impl Into<String>) {
        self.insert(
            keys::REQUESTED_CHANGES,
            serde_json::Value::String(changes.into()),
        );
    }

    pub fn clear_requested_changes(&mut self) {
        self.remove(keys::REQUESTED_CHANGES);
    }

    pub fn deps_analyzed(&self) -> bool {
        self.0
            .get(keys::DEPS_ANALYZED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn mark_deps_analyzed(&mut self) {
        self.insert(keys::DEPS_ANALYZED, serde_json::Value::Bool(true));
    }

    pub fn inferred_deps(&self) -> Vec<Uuid> {
        self.0
            .get(keys::INFERRED_DEPS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn push_inferred_dep(&mut self, blocker: Uuid) {
        let mut deps = self.inferred_deps();
        if !deps.contains(&blocker) {
            deps.push(blocker);
        }
        let value = serde_json::to_value(deps).unwrap_or(serde_json::Value::Null);
        self.insert(keys::INFERRED_DEPS, value);
    }

    pub fn approved_gates(&self) -> Vec<Gate> {
        self.0
            .get(keys::APPROVED_GATES)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn add_approved_gate(&mut self, gate: Gate) {
        let mut gates = self.approved_gates();
        if !gates.contains(&gate) {
            gates.push(gate);
        }
        let value = serde_json::to_value(gates).unwrap_or(serde_json::Value::Null);
        self.insert(keys::APPROVED_GATES, value);
    }

    pub fn clear_approved_gates(&mut self) {
        self.remove(keys::APPROVED_GATES);
    }
}

impl From<BTreeMap<String, serde_json::Value>> for TaskMetadata {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The unit of work.
///
/// `status`, the dependency edges, the hierarchy links and the creation
/// sequence belong to the store: code outside this crate reads them through
/// accessors and changes them only through [`crate::store::TaskStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub task_type: TaskType,
    pub(crate) status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub approval_mode: Option<ApprovalMode>,
    #[serde(default)]
    pub hitl_mode: Option<HitlMode>,
    #[serde(default)]
    pub(crate) blocked_by: Vec<Uuid>,
    #[serde(default)]
    pub(crate) blocks: Vec<Uuid>,
    /// Resolved step sequence; persisted verbatim on first execution.
    #[serde(default)]
    pub pipeline_template: Option<Vec<String>>,
    #[serde(default)]
    pub pending_gate: Option<Gate>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub current_agent_id: Option<Uuid>,
    #[serde(default)]
    pub(crate) parent_id: Option<Uuid>,
    #[serde(default)]
    pub(crate) children_ids: Vec<Uuid>,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub(crate) created_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            task_type,
            status: TaskStatus::Backlog,
            priority: Priority::default(),
            approval_mode: None,
            hitl_mode: None,
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            pipeline_template: None,
            pending_gate: None,
            retry_count: 0,
            current_agent_id: None,
            parent_id: None,
            children_ids: Vec::new(),
            source: TaskSource::Manual,
            metadata: TaskMetadata::new(),
            error: None,
            commit_sha: None,
            created_seq: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn blocked_by(&self) -> &[Uuid] {
        &self.blocked_by
    }

    pub fn blocks(&self) -> &[Uuid] {
        &self.blocks
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn children_ids(&self) -> &[Uuid] {
        &self.children_ids
    }

    pub fn created_seq(&self) -> u64 {
        self.created_seq
    }

    /// HITL mode after applying the legacy `approval_mode` mapping.
    pub fn effective_hitl_mode(&self) -> HitlMode {
        match (self.hitl_mode, self.approval_mode) {
            (Some(mode), _) => mode,
            (None, Some(approval)) => approval.into(),
            (None, None) => HitlMode::Autopilot,
        }
    }

    /// Whether a completed run stops in `in_review` for a human decision.
    pub fn requires_human_review(&self) -> bool {
        self.approval_mode == Some(ApprovalMode::HumanReview)
    }

    pub fn repo_path(&self) -> Option<&str> {
        self.metadata.repo_path()
    }
}

// ---------------------------------------------------------------------------
// NewTask
// ---------------------------------------------------------------------------

/// Input for creating a task through the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub approval_mode: Option<ApprovalMode>,
    #[serde(default)]
    pub hitl_mode: Option<HitlMode>,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub pipeline_template: Option<Vec<String>>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            title: title.into(),
            task_type,
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_hitl_mode(mut self, mode: HitlMode) -> Self {
        self.hitl_mode = Some(mode);
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = Some(mode);
        self
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_repo_path(mut self, path: impl Into<String>) -> Self {
        self.metadata.set_repo_path(path);
        self
    }

    pub fn with_template(mut self, steps: Vec<String>) -> Self {
        self.pipeline_template = Some(steps);
        self
    }

    pub(crate) fn into_task(self) -> Task {
        let mut task = Task::new(self.title, self.task_type);
        task.description = self.description;
        task.priority = self.priority;
        task.approval_mode = self.approval_mode;
        task.hitl_mode = self.hitl_mode;
        task.source = self.source;
        task.metadata = self.metadata;
        task.pipeline_template = self.pipeline_template;
        task
    }
}

// ---------------------------------------------------------------------------
// Run audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
    pub step: String,
    pub status: StepStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    InReview,
    Blocked,
    Interrupted,
}

/// Append-only audit of one `run_task` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub steps: Vec<StepEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

impl RunRecord {
    pub fn start(task_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            steps: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
        }
    }

    pub fn push_step(&mut self, step: impl Into<String>, status: StepStatus) {
        self.steps.push(StepEntry {
            step: step.into(),
            status,
            at: Utc::now(),
        });
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
}

/// One review pass within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCycle {
    pub id: Uuid,
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub attempt: u32,
    pub decision: ReviewDecision,
    pub findings: Vec<Finding>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Implementer,
    Verifier,
    Reviewer,
    Researcher,
}

impl AgentRole {
    /// Role that should handle `step`.
    pub fn for_step(step: &str) -> AgentRole {
        match step {
            "plan" | "plan_impl" | "analyze" | "diagnose" => AgentRole::Planner,
            "implement" | "implement_fix" | "reproduce" | "prototype" | "commit" => {
                AgentRole::Implementer
            }
            "verify" | "benchmark" | "profile" | "scan" | "scan_deps" | "scan_code" => {
                AgentRole::Verifier
            }
            "review" => AgentRole::Reviewer,
            _ => AgentRole::Researcher,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

/// A named worker slot used for role routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            status: AgentStatus::Idle,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_task_type_falls_back_to_feature() {
        assert_eq!(TaskType::parse("quantum_leap"), TaskType::Feature);
        assert_eq!(TaskType::parse("repo_review"), TaskType::RepoReview);
        let parsed: TaskType = serde_json::from_str("\"mystery\"").unwrap();
        assert_eq!(parsed, TaskType::Feature);
        let parsed: TaskType = serde_json::from_str("\"verify_only\"").unwrap();
        assert_eq!(parsed, TaskType::VerifyOnly);
    }

    #[test]
    fn task_type_serializes_snake_case() {
        let json = serde_json::to_string(&TaskType::PlanOnly).unwrap();
        assert_eq!(json, "\"plan_only\"");
    }

    #[test]
    fn priority_orders_p0_first() {
        let mut prios = vec![Priority::P3, Priority::P0, Priority::P2, Priority::P1];
        prios.sort();
        assert_eq!(
            prios,
            vec![Priority::P0, Priority::P1, Priority::P2, Priority::P3]
        );
    }

    #[test]
    fn legacy_approval_mode_maps_only_without_hitl_mode() {
        let mut task = Task::new("t", TaskType::Feature);
        assert_eq!(task.effective_hitl_mode(), HitlMode::Autopilot);

        task.approval_mode = Some(ApprovalMode::HumanReview);
        assert_eq!(task.effective_hitl_mode(), HitlMode::ReviewOnly);

        task.approval_mode = Some(ApprovalMode::AutoApprove);
        assert_eq!(task.effective_hitl_mode(), HitlMode::Autopilot);

        task.hitl_mode = Some(HitlMode::Supervised);
        assert_eq!(task.effective_hitl_mode(), HitlMode::Supervised);
    }

    #[test]
    fn finding_accepts_plain_string() {
        let findings: Vec<Finding> =
            serde_json::from_str(r#"["missing test", {"message": "bad name", "line": 3}]"#)
                .unwrap();
        assert_eq!(findings[0], Finding::new("missing test"));
        assert_eq!(findings[1].line, Some(3));
    }

    #[test]
    fn metadata_review_findings_roundtrip() {
        let mut meta = TaskMetadata::new();
        assert!(meta.review_findings().is_empty());
        meta.set_review_findings(&[Finding::new("a"), Finding::new("b")]);
        assert_eq!(meta.review_findings().len(), 2);
        meta.clear_review_findings();
        assert!(!meta.contains(keys::REVIEW_FINDINGS));
    }

    #[test]
    fn metadata_inferred_deps_are_deduplicated() {
        let mut meta = TaskMetadata::new();
        let id = Uuid::new_v4();
        meta.push_inferred_dep(id);
        meta.push_inferred_dep(id);
        assert_eq!(meta.inferred_deps(), vec![id]);
    }

    #[test]
    fn empty_repo_path_is_treated_as_absent() {
        let mut meta = TaskMetadata::new();
        meta.set_repo_path("");
        assert_eq!(meta.repo_path(), None);
    }

    #[test]
    fn agent_role_routing() {
        assert_eq!(AgentRole::for_step("review"), AgentRole::Reviewer);
        assert_eq!(AgentRole::for_step("implement_fix"), AgentRole::Implementer);
        assert_eq!(AgentRole::for_step("plan"), AgentRole::Planner);
        assert_eq!(AgentRole::for_step("scan_deps"), AgentRole::Verifier);
        assert_eq!(AgentRole::for_step("summarize"), AgentRole::Researcher);
    }
}
