use tl_bridge::event_bus::EventBus;
use tl_bridge::protocol::EventKind;
use tl_core::store::{StoreError, TaskStore};
use tl_core::types::Task;
use uuid::Uuid;

use crate::adapter::TaskSpec;

/// Create one `generated` child of `parent_id` per [`TaskSpec`].
///
/// Children start in `backlog`; nothing runs them automatically.
pub fn spawn_children(
    store: &dyn TaskStore,
    bus: &EventBus,
    parent_id: Uuid,
    specs: Vec<TaskSpec>,
) -> Result<Vec<Task>, StoreError> {
    let mut children = Vec::with_capacity(specs.len());
    for spec in specs {
        let child = store.create_child(parent_id, spec.into_new_task())?;
        bus.emit(child.id, EventKind::TaskCreated, child.title.clone());
        bus.emit(
            parent_id,
            EventKind::ChildCreated { child_id: child.id },
            format!("generated `{}`", child.title),
        );
        children.push(child);
    }
    Ok(children)
}
