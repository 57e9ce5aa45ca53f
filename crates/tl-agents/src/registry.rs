use std::sync::Arc;

use tl_core::store::TaskStore;
use tl_core::types::{AgentRecord, AgentRole, AgentStatus};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),
    #[error("duplicate agent name: `{0}`")]
    DuplicateAgent(String),
}

/// Named worker slots used to label which role handled a step.
///
/// Routing is informational: an absent or busy agent never delays a step,
/// capacity is governed by the orchestrator's concurrency cap.
pub struct AgentRegistry {
    store: Arc<dyn TaskStore>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        role: AgentRole,
    ) -> Result<AgentRecord, RegistryError> {
        let name = name.into();
        if self.store.agents().iter().any(|a| a.name == name) {
            return Err(RegistryError::DuplicateAgent(name));
        }
        let agent = AgentRecord::new(name, role);
        self.store.upsert_agent(agent.clone());
        info!(agent_id = %agent.id, name = %agent.name, role = ?role, "agent registered");
        Ok(agent)
    }

    /// Register one agent per role, named after it, if the registry is empty.
    pub fn ensure_defaults(&self) {
        if !self.store.agents().is_empty() {
            return;
        }
        for role in [
            AgentRole::Planner,
            AgentRole::Implementer,
            AgentRole::Verifier,
            AgentRole::Reviewer,
            AgentRole::Researcher,
        ] {
            let name = format!("{role:?}").to_ascii_lowercase();
            if let Err(e) = self.register(name, role) {
                warn!(role = ?role, error = %e, "failed to register default agent");
            }
        }
    }

    pub fn set_status(&self, id: Uuid, status: AgentStatus) -> Result<AgentRecord, RegistryError> {
        let mut agent = self
            .store
            .agents()
            .into_iter()
            .find(|a| a.id == id)
            .ok_or(RegistryError::AgentNotFound(id))?;
        agent.status = status;
        self.store.upsert_agent(agent.clone());
        Ok(agent)
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        self.store.agents()
    }

    /// First non-offline agent whose role handles `step`.
    pub fn route(&self, step: &str) -> Option<AgentRecord> {
        let role = AgentRole::for_step(step);
        let agent = self
            .store
            .agents()
            .into_iter()
            .find(|a| a.role == role && a.status != AgentStatus::Offline);
        debug!(step, role = ?role, agent = agent.as_ref().map(|a| a.name.as_str()), "route step");
        agent
    }
}
