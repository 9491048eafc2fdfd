use std::sync::Arc;

use tracing::{info, warn};

use chatflow_core::error::{ChatflowError, GraphIssue, Result};
use chatflow_core::flow::{FlowDefinition, FlowDocument, FlowStatus, FlowSummary};
use chatflow_core::state::ExecutionState;
use chatflow_core::traits::{FlowStore, StateStore};
use chatflow_core::types::FlowId;

use crate::graph::{ensure_valid, validate_flow};

/// Authoring-side operations on stored flows: drafts, import/export and
/// activation. Every save creates a new immutable version.
pub struct FlowCatalog {
    flows: Arc<dyn FlowStore>,
    states: Arc<dyn StateStore>,
}

impl FlowCatalog {
    pub fn new(flows: Arc<dyn FlowStore>, states: Arc<dyn StateStore>) -> Self {
        Self { flows, states }
    }

    /// Store `flow` as a new inactive version. Invalid drafts are kept but logged.
    pub async fn save(&self, flow: FlowDefinition) -> Result<FlowDefinition> {
        let issues = validate_flow(&flow);
        let stored = self.flows.create_flow(flow).await?;
        if !issues.is_empty() {
            warn!(flow_id = %stored.id, version = stored.version, issues = issues.len(), "Saved draft has validation issues");
        }
        info!(flow_id = %stored.id, version = stored.version, "Flow version saved");
        Ok(stored)
    }

    /// Import a portable document as a new draft version.
    pub async fn import(&self, json: &str) -> Result<FlowDefinition> {
        let flow = FlowDocument::import(json)?;
        self.save(flow).await
    }

    /// Export a version (latest when `None`) as a portable document.
    pub async fn export(&self, id: &FlowId, version: Option<u32>) -> Result<String> {
        let flow = self.resolve(id, version).await?;
        FlowDocument::export(&flow)
    }

    pub async fn validate(&self, id: &FlowId, version: Option<u32>) -> Result<Vec<GraphIssue>> {
        let flow = self.resolve(id, version).await?;
        Ok(validate_flow(&flow))
    }

    /// Make a version (latest when `None`) the one new runs start on.
    /// Fails when the version has validation issues or its channel is
    /// already bound to another active flow.
    pub async fn activate(&self, id: &FlowId, version: Option<u32>) -> Result<FlowDefinition> {
        let mut flow = self.resolve(id, version).await?;
        ensure_valid(&flow)?;

        if let Some(channel) = flow.channel_binding.as_deref() {
            if let Some(other) = self.flows.active_for_channel(channel).await? {
                if other.id != flow.id {
                    return Err(ChatflowError::Channel {
                        channel: channel.to_string(),
                        message: format!("already bound to active flow '{}'", other.id),
                    });
                }
            }
        }

        self.flows.set_status(&flow.id, flow.version, FlowStatus::Active).await?;
        flow.status = FlowStatus::Active;
        info!(flow_id = %flow.id, version = flow.version, "Flow activated");
        Ok(flow)
    }

    /// Stop new runs from starting. In-flight runs continue on their pinned version.
    pub async fn deactivate(&self, id: &FlowId) -> Result<bool> {
        let Some(active) = self.flows.active_flow(id).await? else {
            return Ok(false);
        };
        self.flows
            .set_status(id, active.version, FlowStatus::Inactive)
            .await?;
        info!(flow_id = %id, version = active.version, "Flow deactivated");
        Ok(true)
    }

    pub async fn list(&self) -> Result<Vec<FlowSummary>> {
        self.flows.list_flows().await
    }

    pub async fn live_runs(&self, id: &FlowId) -> Result<Vec<ExecutionState>> {
        self.states.list_live(id).await
    }

    /// Delete every version. Refused while runs are live.
    pub async fn delete(&self, id: &FlowId) -> Result<usize> {
        let live = self.states.list_live(id).await?;
        if !live.is_empty() {
            return Err(ChatflowError::FlowInUse {
                flow_id: id.to_string(),
                live_runs: live.len(),
            });
        }
        let removed = self.flows.delete_flow(id).await?;
        if removed == 0 {
            return Err(ChatflowError::FlowNotFound(id.to_string()));
        }
        info!(flow_id = %id, versions = removed, "Flow deleted");
        Ok(removed)
    }

    async fn resolve(&self, id: &FlowId, version: Option<u32>) -> Result<FlowDefinition> {
        let found = match version {
            Some(v) => self.flows.get_flow(id, v).await?,
            None => self.flows.latest_flow(id).await?,
        };
        found.ok_or_else(|| match version {
            Some(v) => ChatflowError::FlowNotFound(format!("{} v{}", id, v)),
            None => ChatflowError::FlowNotFound(id.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::types::ContactId;
    use chatflow_store::InMemoryStore;
    use chatflow_test_utils::builder::greeting_menu_flow;
    use chatflow_test_utils::FlowBuilder;

    fn catalog() -> (FlowCatalog, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (FlowCatalog::new(store.clone(), store.clone()), store)
    }

    fn draft() -> FlowDefinition {
        let mut flow = greeting_menu_flow();
        flow.status = FlowStatus::Inactive;
        flow.version = 0;
        flow
    }

    #[tokio::test]
    async fn test_saves_create_versions() {
        let (catalog, _) = catalog();
        assert_eq!(catalog.save(draft()).await.unwrap().version, 1);
        let second = catalog.save(draft()).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.status, FlowStatus::Inactive);
        assert_eq!(catalog.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_export_then_import_is_a_new_draft() {
        let (catalog, _) = catalog();
        let id = catalog.save(draft()).await.unwrap().id;
        catalog.activate(&id, None).await.unwrap();

        let doc = catalog.export(&id, Some(1)).await.unwrap();
        assert!(doc.contains("chatflow/v1"));
        let imported = catalog.import(&doc).await.unwrap();
        assert_eq!(imported.version, 2);
        assert_eq!(imported.status, FlowStatus::Inactive);
        assert_eq!(imported.nodes.len(), draft().nodes.len());
    }

    #[tokio::test]
    async fn test_activate_rejects_invalid_flow() {
        let (catalog, _) = catalog();
        let broken = FlowBuilder::new("broken").start("s").message("m", "hi").build();
        let id = catalog.save(broken).await.unwrap().id;

        let err = catalog.activate(&id, None).await.unwrap_err();
        assert!(matches!(err, ChatflowError::Validation(_)));
        assert!(!catalog.validate(&id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_active_version_per_flow() {
        let (catalog, store) = catalog();
        let id = catalog.save(draft()).await.unwrap().id;
        catalog.save(draft()).await.unwrap();

        catalog.activate(&id, Some(1)).await.unwrap();
        catalog.activate(&id, Some(2)).await.unwrap();
        let active = store.active_flow(&id).await.unwrap().unwrap();
        assert_eq!(active.version, 2);

        assert!(catalog.deactivate(&id).await.unwrap());
        assert!(store.active_flow(&id).await.unwrap().is_none());
        assert!(!catalog.deactivate(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_channel_bound_to_one_active_flow() {
        let (catalog, _) = catalog();
        let first = catalog.save(draft()).await.unwrap();
        catalog.activate(&first.id, None).await.unwrap();

        let mut other = draft();
        other.id = FlowId::from_str("other");
        let other = catalog.save(other).await.unwrap();
        let err = catalog.activate(&other.id, None).await.unwrap_err();
        assert!(matches!(err, ChatflowError::Channel { .. }));
    }

    #[tokio::test]
    async fn test_delete_refused_with_live_runs() {
        let (catalog, store) = catalog();
        let id = catalog.save(draft()).await.unwrap().id;

        let mut state = ExecutionState::new(id.clone(), 1, ContactId::from_str("c1"), "web", "menu");
        state.revision = 1;
        store.save_state(&state).await.unwrap();

        let err = catalog.delete(&id).await.unwrap_err();
        assert!(matches!(err, ChatflowError::FlowInUse { live_runs: 1, .. }));
        assert_eq!(catalog.live_runs(&id).await.unwrap().len(), 1);

        store.delete_state(&state.pair()).await.unwrap();
        assert_eq!(catalog.delete(&id).await.unwrap(), 1);
        assert!(matches!(
            catalog.export(&id, None).await,
            Err(ChatflowError::FlowNotFound(_))
        ));
    }
}
