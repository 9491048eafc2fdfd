use std::sync::Arc;

use chatflow_core::event::EventBus;
use chatflow_core::flow::FlowDefinition;
use chatflow_store::InMemoryStore;
use chatflow_test_utils::{MockCompletionClient, MockHttpClient, MockSubBot, RecordingContacts, RecordingSink};

use crate::engine::{EngineOptions, ExecutionEngine};
use crate::nodes::Services;

pub(crate) struct TestEngine {
    pub engine: Arc<ExecutionEngine>,
    pub store: Arc<InMemoryStore>,
    pub sink: RecordingSink,
}

pub(crate) fn services() -> Services {
    Services {
        http: Arc::new(MockHttpClient::ok("{}")),
        completion: Some(Arc::new(MockCompletionClient::new("hello"))),
        sub_bot: Arc::new(MockSubBot::new()),
        contacts: Arc::new(RecordingContacts::default()),
    }
}

/// Engine over an in-memory store holding `flows` exactly as given.
pub(crate) fn engine(flows: Vec<FlowDefinition>, services: Services) -> TestEngine {
    let store = Arc::new(InMemoryStore::new());
    for flow in flows {
        store.put_flow(flow).unwrap();
    }
    let sink = RecordingSink::default();
    let engine = ExecutionEngine::new(
        store.clone(),
        store.clone(),
        services,
        Arc::new(sink.clone()),
        Arc::new(EventBus::default()),
        EngineOptions::default(),
    );
    TestEngine {
        engine: Arc::new(engine),
        store,
        sink,
    }
}
