use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;

use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::flow::{FlowDefinition, FlowStatus, FlowSummary};
use chatflow_core::state::ExecutionState;
use chatflow_core::traits::{FlowStore, StateStore};
use chatflow_core::types::{ContactId, FlowId, PairKey};

use crate::check_revision;

#[derive(Default)]
struct Inner {
    /// Versions per flow, ascending.
    flows: BTreeMap<FlowId, Vec<FlowDefinition>>,
    live: HashMap<PairKey, ExecutionState>,
    archived: Vec<ExecutionState>,
}

/// Process-local store. Used by simulations and tests.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| ChatflowError::Storage(e.to_string()))
    }

    /// Every archived state, oldest first.
    pub fn archived(&self) -> Result<Vec<ExecutionState>> {
        Ok(self.lock()?.archived.clone())
    }

    /// Insert a definition exactly as given (version included). Test setup helper.
    pub fn put_flow(&self, flow: FlowDefinition) -> Result<()> {
        let mut inner = self.lock()?;
        let versions = inner.flows.entry(flow.id.clone()).or_default();
        versions.retain(|f| f.version != flow.version);
        versions.push(flow);
        versions.sort_by_key(|f| f.version);
        Ok(())
    }
}

impl FlowStore for InMemoryStore {
    fn create_flow(&self, mut flow: FlowDefinition) -> BoxFuture<'_, Result<FlowDefinition>> {
        Box::pin(async move {
            let mut inner = self.lock()?;
            let versions = inner.flows.entry(flow.id.clone()).or_default();
            flow.version = versions.last().map(|f| f.version).unwrap_or(0) + 1;
            flow.status = FlowStatus::Inactive;
            versions.push(flow.clone());
            Ok(flow)
        })
    }

    fn get_flow(&self, id: &FlowId, version: u32) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let id = id.clone();
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner
                .flows
                .get(&id)
                .and_then(|v| v.iter().find(|f| f.version == version))
                .cloned())
        })
    }

    fn latest_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let id = id.clone();
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner.flows.get(&id).and_then(|v| v.last()).cloned())
        })
    }

    fn active_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let id = id.clone();
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner
                .flows
                .get(&id)
                .and_then(|v| v.iter().find(|f| f.is_active()))
                .cloned())
        })
    }

    fn active_for_channel(&self, channel: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let channel = channel.to_string();
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner
                .flows
                .values()
                .flatten()
                .find(|f| f.is_active() && f.channel_binding.as_deref() == Some(channel.as_str()))
                .cloned())
        })
    }

    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<FlowSummary>>> {
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner.flows.values().flatten().map(|f| f.summary()).collect())
        })
    }

    fn set_status(&self, id: &FlowId, version: u32, status: FlowStatus) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let versions = inner
                .flows
                .get_mut(&id)
                .ok_or_else(|| ChatflowError::FlowNotFound(id.to_string()))?;
            if !versions.iter().any(|f| f.version == version) {
                return Err(ChatflowError::FlowNotFound(format!("{} v{}", id, version)));
            }
            for flow in versions.iter_mut() {
                if flow.version == version {
                    flow.status = status;
                } else if status == FlowStatus::Active {
                    flow.status = FlowStatus::Inactive;
                }
            }
            Ok(())
        })
    }

    fn delete_flow(&self, id: &FlowId) -> BoxFuture<'_, Result<usize>> {
        let id = id.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            Ok(inner.flows.remove(&id).map(|v| v.len()).unwrap_or(0))
        })
    }
}

impl StateStore for InMemoryStore {
    fn load_state(&self, pair: &PairKey) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        let pair = pair.clone();
        Box::pin(async move { Ok(self.lock()?.live.get(&pair).cloned()) })
    }

    fn save_state(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let pair = state.pair();
            check_revision(&state, inner.live.get(&pair).map(|s| s.revision))?;
            inner.live.insert(pair, state);
            Ok(())
        })
    }

    fn archive_state(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;
            let pair = state.pair();
            check_revision(&state, inner.live.get(&pair).map(|s| s.revision))?;
            inner.live.remove(&pair);
            inner.archived.push(state);
            Ok(())
        })
    }

    fn commit_states(
        &self,
        closed: &[ExecutionState],
        live: Option<&ExecutionState>,
    ) -> BoxFuture<'_, Result<()>> {
        let closed = closed.to_vec();
        let live = live.cloned();
        Box::pin(async move {
            let mut inner = self.lock()?;

            // Check everything against the revisions the earlier writes leave behind
            let mut staged: HashMap<PairKey, Option<u64>> = HashMap::new();
            for state in &closed {
                let pair = state.pair();
                let stored = match staged.get(&pair) {
                    Some(rev) => *rev,
                    None => inner.live.get(&pair).map(|s| s.revision),
                };
                check_revision(state, stored)?;
                staged.insert(pair, None);
            }
            if let Some(state) = &live {
                let pair = state.pair();
                let stored = match staged.get(&pair) {
                    Some(rev) => *rev,
                    None => inner.live.get(&pair).map(|s| s.revision),
                };
                check_revision(state, stored)?;
            }

            for state in closed {
                inner.live.remove(&state.pair());
                inner.archived.push(state);
            }
            if let Some(state) = live {
                inner.live.insert(state.pair(), state);
            }
            Ok(())
        })
    }

    fn last_archived(&self, pair: &PairKey) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        let pair = pair.clone();
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner.archived.iter().rev().find(|s| s.pair() == pair).cloned())
        })
    }

    fn delete_state(&self, pair: &PairKey) -> BoxFuture<'_, Result<bool>> {
        let pair = pair.clone();
        Box::pin(async move { Ok(self.lock()?.live.remove(&pair).is_some()) })
    }

    fn live_for_contact(&self, contact: &ContactId) -> BoxFuture<'_, Result<Vec<ExecutionState>>> {
        let contact = contact.clone();
        Box::pin(async move {
            let inner = self.lock()?;
            let mut states: Vec<_> = inner
                .live
                .values()
                .filter(|s| s.contact_id == contact)
                .cloned()
                .collect();
            states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(states)
        })
    }

    fn list_live(&self, flow_id: &FlowId) -> BoxFuture<'_, Result<Vec<ExecutionState>>> {
        let flow_id = flow_id.clone();
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner
                .live
                .values()
                .filter(|s| s.flow_id == flow_id)
                .cloned()
                .collect())
        })
    }
}
