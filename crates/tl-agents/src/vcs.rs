//! Version control for completed tasks.
//!
//! All tasks of one orchestrator session commit onto a single run branch, in
//! the order they finish. [`SessionVcs`] enforces that over any
//! [`VcsIntegration`] backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait VcsIntegration: Send + Sync {
    /// Make sure the session branch exists and is checked out; returns its name.
    async fn ensure_branch(&self) -> Result<String, VcsError>;

    /// Commit the working tree; returns the new commit sha if the backend
    /// produces one.
    async fn commit(&self, task_id: Uuid, message: &str) -> Result<Option<String>, VcsError>;
}

/// Commit message tagged with the owning task.
pub fn commit_message(task_id: Uuid, title: &str) -> String {
    format!("[task {task_id}] {title}")
}

// ---------------------------------------------------------------------------
// NoopVcs
// ---------------------------------------------------------------------------

/// Backend used when version control is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopVcs;

#[async_trait::async_trait]
impl VcsIntegration for NoopVcs {
    async fn ensure_branch(&self) -> Result<String, VcsError> {
        Ok(String::new())
    }

    async fn commit(&self, _task_id: Uuid, _message: &str) -> Result<Option<String>, VcsError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// GitCliVcs
// ---------------------------------------------------------------------------

/// Shells out to the `git` binary in `repo_path`.
#[derive(Debug, Clone)]
pub struct GitCliVcs {
    repo_path: PathBuf,
    branch: String,
}

impl GitCliVcs {
    /// `branch_prefix` gets a UTC timestamp suffix, e.g.
    /// `taskloom/run-20260101-120000`.
    pub fn new(repo_path: impl Into<PathBuf>, branch_prefix: &str) -> Self {
        let branch = format!("{branch_prefix}-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        Self::with_branch(repo_path, branch)
    }

    pub fn with_branch(repo_path: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            branch: branch.into(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    async fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(VcsError::GitCommand(format!(
                "git {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait::async_trait]
impl VcsIntegration for GitCliVcs {
    async fn ensure_branch(&self) -> Result<String, VcsError> {
        // Detached HEAD has no symbolic name.
        let current = self
            .git(&["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await
            .ok();
        if current.as_deref() != Some(self.branch.as_str()) {
            self.git(&["checkout", "-B", &self.branch]).await?;
            info!(branch = %self.branch, repo = %self.repo_path.display(), "checked out run branch");
        }
        Ok(self.branch.clone())
    }

    async fn commit(&self, task_id: Uuid, message: &str) -> Result<Option<String>, VcsError> {
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "--allow-empty", "-m", message]).await?;
        let sha = self.git(&["rev-parse", "HEAD"]).await?;
        debug!(task_id = %task_id, sha = %sha, "committed");
        Ok(Some(sha))
    }
}

// ---------------------------------------------------------------------------
// SessionVcs
// ---------------------------------------------------------------------------

/// Session wrapper: the branch is ensured once, commits are serialized.
pub struct SessionVcs {
    backend: Arc<dyn VcsIntegration>,
    branch: OnceCell<String>,
    commit_lock: Mutex<()>,
}

impl SessionVcs {
    pub fn new(backend: Arc<dyn VcsIntegration>) -> Self {
        Self {
            backend,
            branch: OnceCell::new(),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopVcs))
    }

    /// Session branch, if it has been established.
    pub fn branch(&self) -> Option<&str> {
        self.branch.get().map(String::as_str)
    }

    /// Commit on the session branch with a task-tagged message.
    pub async fn commit_task(&self, task_id: Uuid, title: &str) -> Result<Option<String>, VcsError> {
        let _guard = self.commit_lock.lock().await;
        self.branch
            .get_or_try_init(|| self.backend.ensure_branch())
            .await?;
        self.backend
            .commit(task_id, &commit_message(task_id, title))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recording {
        branches: AtomicUsize,
        messages: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl VcsIntegration for Recording {
        async fn ensure_branch(&self) -> Result<String, VcsError> {
            self.branches.fetch_add(1, Ordering::SeqCst);
            Ok("taskloom/run-test".into())
        }

        async fn commit(&self, _task_id: Uuid, message: &str) -> Result<Option<String>, VcsError> {
            let mut messages = self.messages.lock().unwrap();
            messages.push(message.to_string());
            Ok(Some(format!("sha{}", messages.len())))
        }
    }

    #[tokio::test]
    async fn branch_is_ensured_once_per_session() {
        let backend = Arc::new(Recording::default());
        let vcs = SessionVcs::new(backend.clone());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(vcs.commit_task(a, "first").await.unwrap().as_deref(), Some("sha1"));
        assert_eq!(vcs.commit_task(b, "second").await.unwrap().as_deref(), Some("sha2"));

        assert_eq!(backend.branches.load(Ordering::SeqCst), 1);
        assert_eq!(vcs.branch(), Some("taskloom/run-test"));
        let messages = backend.messages.lock().unwrap();
        assert_eq!(messages[0], format!("[task {a}] first"));
        assert_eq!(messages[1], format!("[task {b}] second"));
    }

    #[tokio::test]
    async fn disabled_vcs_yields_no_sha() {
        let vcs = SessionVcs::disabled();
        assert_eq!(vcs.commit_task(Uuid::new_v4(), "x").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn git_cli_commits_on_run_branch() {
        let dir = tempfile::tempdir().unwrap();
        let init = std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir.path())
            .status();
        if !matches!(init, Ok(s) if s.success()) {
            // git is not installed on this machine.
            return;
        }
        for (key, value) in [("user.email", "ci@example.com"), ("user.name", "ci")] {
            std::process::Command::new("git")
                .args(["config", key, value])
                .current_dir(dir.path())
                .status()
                .unwrap();
        }
        std::process::Command::new("git")
            .args(["commit", "-q", "--allow-empty", "-m", "root"])
            .current_dir(dir.path())
            .status()
            .unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let git = GitCliVcs::with_branch(dir.path(), "taskloom/run-test");
        let vcs = SessionVcs::new(Arc::new(git.clone()));
        let id = Uuid::new_v4();
        let sha = vcs.commit_task(id, "add a").await.unwrap().unwrap();
        assert_eq!(sha.len(), 40);

        let log = git.git(&["log", "-1", "--format=%s"]).await.unwrap();
        assert_eq!(log, format!("[task {id}] add a"));
        let branch = git.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await.unwrap();
        assert_eq!(branch, "taskloom/run-test");
    }
}
