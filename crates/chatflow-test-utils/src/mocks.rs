use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::state::ExecutionState;
use chatflow_core::traits::*;
use chatflow_core::types::{ContactId, FlowId, HandoffRecord, MediaRef, OutgoingMessage, PairKey, TagAction};

/// Scripted HTTP client. Replies are consumed in order; the fallback answers the rest.
pub struct MockHttpClient {
    replies: Mutex<VecDeque<Result<HttpResponse>>>,
    fallback: HttpResponse,
    hang: bool,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    /// Always answers `200` with `body`.
    pub fn ok(body: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: HttpResponse {
                status: 200,
                body: body.to_string(),
            },
            hang: false,
            requests: Mutex::new(vec![]),
        }
    }

    /// Always answers with `status`.
    pub fn status(status: u16) -> Self {
        let mut mock = Self::ok("");
        mock.fallback.status = status;
        mock
    }

    /// Never responds.
    pub fn hanging() -> Self {
        let mut mock = Self::ok("");
        mock.hang = true;
        mock
    }

    pub fn with_reply(self, reply: Result<HttpResponse>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl HttpClient for MockHttpClient {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        self.requests.lock().unwrap().push(request);
        let next = self.replies.lock().unwrap().pop_front();
        Box::pin(async move {
            if self.hang {
                std::future::pending::<()>().await;
            }
            match next {
                Some(reply) => reply,
                None => Ok(self.fallback.clone()),
            }
        })
    }
}

/// Scripted completion provider.
pub struct MockCompletionClient {
    replies: Mutex<VecDeque<Result<String>>>,
    fallback: String,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompletionClient {
    pub fn new(fallback: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: fallback.to_string(),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn failing() -> Self {
        Self::new("").with_reply(Err(ChatflowError::Integration {
            target: "completion".into(),
            message: "provider unavailable".into(),
        }))
    }

    pub fn with_reply(self, reply: Result<String>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl CompletionClient for MockCompletionClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        self.requests.lock().unwrap().push(request);
        let next = self.replies.lock().unwrap().pop_front();
        Box::pin(async move {
            let text = match next {
                Some(reply) => reply?,
                None => self.fallback.clone(),
            };
            Ok(CompletionResponse { text })
        })
    }

    fn synthesize(&self, text: &str, voice: &str) -> BoxFuture<'_, Result<MediaRef>> {
        let url = format!("mock://tts/{}/{}", voice, text.len());
        Box::pin(async move {
            Ok(MediaRef {
                url,
                mime_type: Some("audio/mpeg".into()),
            })
        })
    }
}

/// Scripted sub-bot provider.
pub struct MockSubBot {
    replies: Mutex<VecDeque<Result<SubBotReply>>>,
    requests: Mutex<Vec<SubBotRequest>>,
}

impl MockSubBot {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn with_reply(self, reply: Result<SubBotReply>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    /// Reply that keeps control with the sub-bot.
    pub fn keep(messages: &[&str]) -> Result<SubBotReply> {
        Ok(SubBotReply {
            messages: messages.iter().map(|m| m.to_string()).collect(),
            done: false,
            result: None,
        })
    }

    /// Reply that hands control back.
    pub fn done(result: Option<&str>) -> Result<SubBotReply> {
        Ok(SubBotReply {
            messages: vec![],
            done: true,
            result: result.map(String::from),
        })
    }

    pub fn requests(&self) -> Vec<SubBotRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockSubBot {
    fn default() -> Self {
        Self::new()
    }
}

impl SubBotClient for MockSubBot {
    fn delegate(&self, request: SubBotRequest) -> BoxFuture<'_, Result<SubBotReply>> {
        self.requests.lock().unwrap().push(request);
        let next = self.replies.lock().unwrap().pop_front();
        Box::pin(async move { next.unwrap_or_else(|| Ok(SubBotReply::default())) })
    }
}

/// Records every tag operation.
#[derive(Default)]
pub struct RecordingContacts {
    calls: Mutex<Vec<(ContactId, TagAction, Vec<String>)>>,
}

impl RecordingContacts {
    pub fn calls(&self) -> Vec<(ContactId, TagAction, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ContactDirectory for RecordingContacts {
    fn apply_tags(
        &self,
        contact: &ContactId,
        action: TagAction,
        tags: &[String],
    ) -> BoxFuture<'_, Result<()>> {
        self.calls
            .lock()
            .unwrap()
            .push((contact.clone(), action, tags.to_vec()));
        Box::pin(async { Ok(()) })
    }
}

/// Effect sink that records deliveries and handoffs. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<OutgoingMessage>>>,
    handoffs: Arc<Mutex<Vec<HandoffRecord>>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<OutgoingMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.content).collect()
    }

    pub fn handoffs(&self) -> Vec<HandoffRecord> {
        self.handoffs.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
        self.handoffs.lock().unwrap().clear();
    }
}

impl EffectSink for RecordingSink {
    fn deliver(&self, message: &OutgoingMessage) -> BoxFuture<'_, Result<()>> {
        self.messages.lock().unwrap().push(message.clone());
        Box::pin(async { Ok(()) })
    }

    fn handoff(&self, record: &HandoffRecord) -> BoxFuture<'_, Result<()>> {
        self.handoffs.lock().unwrap().push(record.clone());
        Box::pin(async { Ok(()) })
    }
}

/// State store wrapper whose next `commit_states` calls fail with a storage
/// error before reaching the inner store. Every other call passes through.
pub struct FailingStates {
    inner: Arc<dyn StateStore>,
    failures: Mutex<usize>,
    attempts: Mutex<usize>,
}

impl FailingStates {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            failures: Mutex::new(0),
            attempts: Mutex::new(0),
        }
    }

    /// Fail the next `count` commits.
    pub fn fail_commits(&self, count: usize) {
        *self.failures.lock().unwrap() = count;
    }

    /// Commits attempted so far, failed ones included.
    pub fn commit_attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

impl StateStore for FailingStates {
    fn load_state(&self, pair: &PairKey) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        self.inner.load_state(pair)
    }

    fn save_state(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>> {
        self.inner.save_state(state)
    }

    fn archive_state(&self, state: &ExecutionState) -> BoxFuture<'_, Result<()>> {
        self.inner.archive_state(state)
    }

    fn commit_states(
        &self,
        closed: &[ExecutionState],
        live: Option<&ExecutionState>,
    ) -> BoxFuture<'_, Result<()>> {
        *self.attempts.lock().unwrap() += 1;
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Box::pin(async { Err(ChatflowError::Storage("disk gone".into())) });
        }
        self.inner.commit_states(closed, live)
    }

    fn last_archived(&self, pair: &PairKey) -> BoxFuture<'_, Result<Option<ExecutionState>>> {
        self.inner.last_archived(pair)
    }

    fn delete_state(&self, pair: &PairKey) -> BoxFuture<'_, Result<bool>> {
        self.inner.delete_state(pair)
    }

    fn live_for_contact(&self, contact: &ContactId) -> BoxFuture<'_, Result<Vec<ExecutionState>>> {
        self.inner.live_for_contact(contact)
    }

    fn list_live(&self, flow_id: &FlowId) -> BoxFuture<'_, Result<Vec<ExecutionState>>> {
        self.inner.list_live(flow_id)
    }
}
