//! Durable backing for the in-memory task index.
//!
//! [`JsonFilePersistence`] writes one JSON document per record:
//!
//! ```text
//! <base>/tasks/<task-id>.json
//! <base>/runs/<run-id>.json
//! <base>/agents/<agent-id>.json
//! <base>/reviews.jsonl
//! ```
//!
//! Files are written to a temporary sibling and renamed into place so a
//! crash never leaves a half-written record behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::types::{AgentRecord, ReviewCycle, RunRecord, Task};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Everything needed to rebuild the store after a restart.
#[derive(Debug, Default)]
pub struct PersistedState {
    pub tasks: Vec<Task>,
    pub runs: Vec<RunRecord>,
    pub reviews: Vec<ReviewCycle>,
    pub agents: Vec<AgentRecord>,
}

pub trait Persistence: Send + Sync {
    fn load(&self) -> Result<PersistedState, PersistenceError>;
    fn save_task(&self, task: &Task) -> Result<(), PersistenceError>;
    fn save_run(&self, run: &RunRecord) -> Result<(), PersistenceError>;
    fn append_review(&self, cycle: &ReviewCycle) -> Result<(), PersistenceError>;
    fn save_agent(&self, agent: &AgentRecord) -> Result<(), PersistenceError>;
}

/// Keeps nothing; the store is purely in-memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

impl Persistence for NullPersistence {
    fn load(&self) -> Result<PersistedState, PersistenceError> {
        Ok(PersistedState::default())
    }

    fn save_task(&self, _task: &Task) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn save_run(&self, _run: &RunRecord) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn append_review(&self, _cycle: &ReviewCycle) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn save_agent(&self, _agent: &AgentRecord) -> Result<(), PersistenceError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFilePersistence
// ---------------------------------------------------------------------------

pub struct JsonFilePersistence {
    base_dir: PathBuf,
}

impl JsonFilePersistence {
    /// Use `base_dir`, creating the directory layout if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let base_dir = base_dir.into();
        for sub in ["tasks", "runs", "agents"] {
            fs::create_dir_all(base_dir.join(sub))?;
        }
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, kind: &str, id: Uuid) -> PathBuf {
        self.base_dir.join(kind).join(format!("{id}.json"))
    }

    fn reviews_path(&self) -> PathBuf {
        self.base_dir.join("reviews.jsonl")
    }

    fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn load_dir<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, PersistenceError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.base_dir.join(kind))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str(&text) {
                Ok(value) => out.push(value),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }
}

impl Persistence for JsonFilePersistence {
    fn load(&self) -> Result<PersistedState, PersistenceError> {
        let tasks = self.load_dir("tasks")?;
        let runs = self.load_dir("runs")?;
        let agents = self.load_dir("agents")?;

        let mut reviews = Vec::new();
        let path = self.reviews_path();
        if path.exists() {
            for line in fs::read_to_string(&path)?.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(line) {
                    Ok(cycle) => reviews.push(cycle),
                    Err(e) => warn!(error = %e, "skipping unreadable review cycle"),
                }
            }
        }

        Ok(PersistedState {
            tasks,
            runs,
            reviews,
            agents,
        })
    }

    fn save_task(&self, task: &Task) -> Result<(), PersistenceError> {
        self.write_atomic(&self.record_path("tasks", task.id), task)
    }

    fn save_run(&self, run: &RunRecord) -> Result<(), PersistenceError> {
        self.write_atomic(&self.record_path("runs", run.id), run)
    }

    fn append_review(&self, cycle: &ReviewCycle) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(cycle)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.reviews_path())?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn save_agent(&self, agent: &AgentRecord) -> Result<(), PersistenceError> {
        self.write_atomic(&self.record_path("agents", agent.id), agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentRole, ReviewDecision, TaskType};
    use chrono::Utc;

    #[test]
    fn new_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonFilePersistence::new(dir.path().join("store")).unwrap();
        assert!(p.base_dir().join("tasks").is_dir());
        assert!(p.base_dir().join("runs").is_dir());
        assert!(p.base_dir().join("agents").is_dir());
    }

    #[test]
    fn saved_records_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonFilePersistence::new(dir.path()).unwrap();

        let task = Task::new("persist me", TaskType::Bug);
        p.save_task(&task).unwrap();
        let run = RunRecord::start(task.id);
        p.save_run(&run).unwrap();
        p.save_agent(&AgentRecord::new("rev-1", AgentRole::Reviewer))
            .unwrap();
        for attempt in 1..=2 {
            p.append_review(&ReviewCycle {
                id: Uuid::new_v4(),
                task_id: task.id,
                run_id: run.id,
                attempt,
                decision: ReviewDecision::ChangesRequested,
                findings: vec![],
                recorded_at: Utc::now(),
            })
            .unwrap();
        }

        let state = p.load().unwrap();
        assert_eq!(state.tasks, vec![task]);
        assert_eq!(state.runs, vec![run]);
        assert_eq!(state.agents.len(), 1);
        assert_eq!(state.reviews.len(), 2);
    }

    #[test]
    fn corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let p = JsonFilePersistence::new(dir.path()).unwrap();
        fs::write(dir.path().join("tasks").join("broken.json"), "{not json").unwrap();
        let state = p.load().unwrap();
        assert!(state.tasks.is_empty());
    }
}
