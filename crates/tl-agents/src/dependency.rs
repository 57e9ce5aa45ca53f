//! Infers dependency edges among freshly created tasks.
//!
//! Each unanalysed task is shown to the worker's `analyze_deps` step along
//! with its peers (the other unanalysed tasks). Returned edges are applied
//! one at a time through the store, which refuses any that would close a
//! cycle; refused edges are dropped and the rest of the batch still applies.

use std::sync::Arc;

use serde_json::json;
use tl_core::pipeline::steps;
use tl_core::store::{TaskFilter, TaskStore};
use tl_core::types::{keys, Task, TaskSource, TaskStatus};
use tracing::{debug, info, warn};

use crate::adapter::{run_step_contained, DependencyEdge, WorkerAdapter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisReport {
    /// Tasks handed to the adapter and marked analysed.
    pub analyzed: usize,
    pub applied: usize,
    pub rejected: usize,
}

pub struct DependencyAnalyzer {
    store: Arc<dyn TaskStore>,
    adapter: Arc<dyn WorkerAdapter>,
}

impl DependencyAnalyzer {
    pub fn new(store: Arc<dyn TaskStore>, adapter: Arc<dyn WorkerAdapter>) -> Self {
        Self { store, adapter }
    }

    /// Tasks that still need analysis: waiting to run, not imported, not yet
    /// analysed.
    fn pending(&self) -> Vec<Task> {
        self.store
            .list(&TaskFilter::all())
            .into_iter()
            .filter(|t| matches!(t.status(), TaskStatus::Backlog | TaskStatus::Ready))
            .filter(|t| t.source != TaskSource::Import)
            .filter(|t| !t.metadata.deps_analyzed())
            .collect()
    }

    pub async fn run_pass(&self) -> AnalysisReport {
        let batch = self.pending();
        let mut report = AnalysisReport::default();
        // A lone task has nothing to depend on; leave it for a later batch.
        if batch.len() < 2 {
            return report;
        }

        for task in &batch {
            let peers: Vec<_> = batch
                .iter()
                .filter(|p| p.id != task.id)
                .map(|p| json!({ "id": p.id, "title": p.title }))
                .collect();
            let mut view = task.clone();
            view.metadata.insert(keys::ANALYSIS_PEERS, json!(peers));

            match run_step_contained(self.adapter.as_ref(), &view, steps::ANALYZE_DEPS, 1).await {
                Ok(result) if result.is_ok() => {
                    for edge in result.dependency_edges.unwrap_or_default() {
                        if self.apply(edge) {
                            report.applied += 1;
                        } else {
                            report.rejected += 1;
                        }
                    }
                }
                Ok(result) => {
                    warn!(task_id = %task.id, summary = %result.summary, "dependency analysis returned error");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "dependency analysis failed");
                }
            }

            if let Err(e) = self
                .store
                .update(task.id, &mut |t| t.metadata.mark_deps_analyzed())
            {
                warn!(task_id = %task.id, error = %e, "failed to mark task analysed");
            }
            report.analyzed += 1;
        }

        info!(
            analyzed = report.analyzed,
            applied = report.applied,
            rejected = report.rejected,
            "dependency analysis pass complete"
        );
        report
    }

    fn apply(&self, edge: DependencyEdge) -> bool {
        match self.store.add_dependency(edge.from, edge.to) {
            Ok(()) => {
                if let Err(e) = self
                    .store
                    .update(edge.to, &mut |t| t.metadata.push_inferred_dep(edge.from))
                {
                    warn!(task_id = %edge.to, error = %e, "failed to record inferred dependency");
                }
                debug!(blocker = %edge.from, dependent = %edge.to, "inferred dependency applied");
                true
            }
            Err(e) => {
                warn!(blocker = %edge.from, dependent = %edge.to, error = %e, "inferred dependency rejected");
                false
            }
        }
    }
}
