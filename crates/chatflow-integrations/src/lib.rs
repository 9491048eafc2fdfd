pub mod completion;
pub mod contacts;
pub mod http;
pub mod retry;
pub mod subbot;

use std::sync::Arc;

use chatflow_core::config::{HttpConfig, LlmConfig};
use chatflow_core::traits::{CompletionClient, ContactDirectory, HttpClient, SubBotClient};

pub use completion::OpenAiCompletionClient;
pub use contacts::LogContactDirectory;
pub use http::ReqwestHttpClient;
pub use retry::RetryingCompletionClient;
pub use subbot::HttpSubBotClient;

/// HTTP client for webhook and API request nodes.
pub fn create_http_client(config: &HttpConfig) -> Arc<dyn HttpClient> {
    Arc::new(ReqwestHttpClient::new(config))
}

/// Completion client for language model nodes, wrapped in retries when configured.
///
/// Every provider is spoken to through the OpenAI-compatible API.
pub fn create_completion_client(config: &LlmConfig, http: &HttpConfig) -> Arc<dyn CompletionClient> {
    let client = OpenAiCompletionClient::new(config.clone(), http);
    match &config.retry {
        Some(retry) => Arc::new(RetryingCompletionClient::new(Box::new(client), retry.clone())),
        None => Arc::new(client),
    }
}

/// Sub-bot client for delegate nodes.
pub fn create_sub_bot_client(config: &HttpConfig) -> Arc<dyn SubBotClient> {
    Arc::new(HttpSubBotClient::new(config))
}

/// Contact directory for tag nodes.
pub fn create_contact_directory() -> Arc<dyn ContactDirectory> {
    Arc::new(LogContactDirectory)
}
