//! Authoring operations against the SQLite store, and how they affect runs.

use std::sync::Arc;

use chatflow_core::error::ChatflowError;
use chatflow_core::event::EventBus;
use chatflow_core::flow::{FlowDefinition, FlowDocument, FlowStatus, NodeKind};
use chatflow_core::state::RunStatus;
use chatflow_core::traits::StateStore;
use chatflow_core::types::{ContactId, FlowId, PairKey};
use chatflow_engine::{EngineOptions, ExecutionEngine, FlowCatalog, Services, SimulationRunner, TranscriptEntry};
use chatflow_store::SqliteStore;
use chatflow_test_utils::builder::greeting_menu_flow;
use chatflow_test_utils::{text_event, MockCompletionClient, MockHttpClient, MockSubBot, RecordingContacts, RecordingSink};

fn draft() -> FlowDefinition {
    let mut flow = greeting_menu_flow();
    flow.status = FlowStatus::Inactive;
    flow.version = 0;
    flow
}

fn with_greeting(text: &str) -> FlowDefinition {
    let mut flow = draft();
    for node in flow.nodes.iter_mut() {
        if let NodeKind::Message(props) = &mut node.kind {
            props.text = text.to_string();
        }
    }
    flow
}

fn engine(store: Arc<SqliteStore>) -> (ExecutionEngine, RecordingSink) {
    let sink = RecordingSink::default();
    let services = Services {
        http: Arc::new(MockHttpClient::ok("{}")),
        completion: Some(Arc::new(MockCompletionClient::new("ok"))),
        sub_bot: Arc::new(MockSubBot::new()),
        contacts: Arc::new(RecordingContacts::default()),
    };
    let engine = ExecutionEngine::new(
        store.clone(),
        store,
        services,
        Arc::new(sink.clone()),
        Arc::new(EventBus::default()),
        EngineOptions::default(),
    );
    (engine, sink)
}

#[tokio::test]
async fn test_document_import_activate_export() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("flows.db")).unwrap());
    let catalog = FlowCatalog::new(store.clone(), store.clone());

    let doc = FlowDocument::export(&greeting_menu_flow()).unwrap();
    let imported = catalog.import(&doc).await.unwrap();
    assert_eq!(imported.version, 1);
    assert_eq!(imported.status, FlowStatus::Inactive);

    catalog.activate(&imported.id, None).await.unwrap();
    let listed = catalog.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, FlowStatus::Active);
    assert_eq!(listed[0].channel_binding.as_deref(), Some("web"));

    let exported = catalog.export(&imported.id, Some(1)).await.unwrap();
    let again = FlowDocument::import(&exported).unwrap();
    assert_eq!(again.nodes.len(), imported.nodes.len());
    assert_eq!(again.edges.len(), imported.edges.len());

    let bad = exported.replace("chatflow/v1", "chatflow/v0");
    assert!(matches!(catalog.import(&bad).await, Err(ChatflowError::Config(_))));
}

#[tokio::test]
async fn test_runs_stay_on_their_pinned_version() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let catalog = FlowCatalog::new(store.clone(), store.clone());
    let id = FlowId::from_str("greeting");

    catalog.save(with_greeting("Hi")).await.unwrap();
    catalog.activate(&id, Some(1)).await.unwrap();

    let (engine, sink) = engine(store.clone());
    let early = ContactId::from_str("early");
    engine.advance(&early, &id, text_event("early", "web", "hello")).await.unwrap();

    catalog.save(with_greeting("Welcome back")).await.unwrap();
    catalog.activate(&id, Some(2)).await.unwrap();

    // A new contact starts on version 2
    sink.clear();
    let late = ContactId::from_str("late");
    engine.advance(&late, &id, text_event("late", "web", "hello")).await.unwrap();
    assert_eq!(sink.texts()[0], "Welcome back");
    let late_state = store.load_state(&PairKey::new(id.clone(), late)).await.unwrap().unwrap();
    assert_eq!(late_state.flow_version, 2);

    // The earlier run finishes on version 1
    let done = engine.advance(&early, &id, text_event("early", "web", "Sales")).await.unwrap();
    assert_eq!(done.status, Some(RunStatus::Completed));
    let archived = store
        .last_archived(&PairKey::new(id.clone(), early))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archived.flow_version, 1);
}

#[tokio::test]
async fn test_deactivation_blocks_new_runs_only() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let catalog = FlowCatalog::new(store.clone(), store.clone());
    let id = catalog.save(draft()).await.unwrap().id;
    catalog.activate(&id, None).await.unwrap();

    let (engine, _) = engine(store.clone());
    let c1 = ContactId::from_str("c1");
    engine.advance(&c1, &id, text_event("c1", "web", "hello")).await.unwrap();

    assert!(catalog.deactivate(&id).await.unwrap());

    let err = engine
        .advance(&ContactId::from_str("c2"), &id, text_event("c2", "web", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatflowError::FlowInactive(_)));

    let finished = engine.advance(&c1, &id, text_event("c1", "web", "Support")).await.unwrap();
    assert_eq!(finished.status, Some(RunStatus::Completed));

    // With no live runs left the flow can go
    assert!(catalog.live_runs(&id).await.unwrap().is_empty());
    assert_eq!(catalog.delete(&id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_simulating_a_stored_draft() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let catalog = FlowCatalog::new(store.clone(), store.clone());
    let stored = catalog.save(draft()).await.unwrap();

    let transcript = SimulationRunner::new(stored)
        .with_script(["Sales"])
        .start()
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert!(matches!(transcript.first(), Some(TranscriptEntry::Inbound { text }) if text == "hi"));
    assert!(transcript
        .iter()
        .any(|e| matches!(e, TranscriptEntry::Handoff(r) if r.target.to_string() == "queue:queueB")));
    assert!(matches!(
        transcript.last(),
        Some(TranscriptEntry::Finished { status: RunStatus::Completed, .. })
    ));

    // Previews never touch stored state
    let pair = PairKey::new(FlowId::from_str("greeting"), ContactId::from_str("simulator"));
    assert!(store.load_state(&pair).await.unwrap().is_none());
}
