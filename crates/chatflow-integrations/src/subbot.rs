use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::debug;

use chatflow_core::config::HttpConfig;
use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::traits::{SubBotClient, SubBotReply, SubBotRequest};

/// Delegates conversations to an external bot over HTTP.
///
/// `POST {base_url}/flows/{flow_id}/messages` with the request as JSON; the
/// response body is a [`SubBotReply`].
pub struct HttpSubBotClient {
    http: Client,
}

impl HttpSubBotClient {
    pub fn new(config: &HttpConfig) -> Self {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http }
    }
}

pub(crate) fn delegate_url(base_url: &str, flow_id: &str) -> String {
    format!("{}/flows/{}/messages", base_url.trim_end_matches('/'), flow_id)
}

impl SubBotClient for HttpSubBotClient {
    fn delegate(&self, request: SubBotRequest) -> BoxFuture<'_, Result<SubBotReply>> {
        Box::pin(async move {
            let url = delegate_url(&request.base_url, &request.flow_id);
            let err = |message: String| ChatflowError::Integration {
                target: format!("subbot:{}", request.flow_id),
                message,
            };

            let mut req = self.http.post(&url).json(&request);
            if let Some(token) = &request.token {
                req = req.header("Authorization", format!("Bearer {}", token));
            }

            let response = req.send().await.map_err(|e| err(e.to_string()))?;
            if !response.status().is_success() {
                return Err(err(format!("HTTP {}", response.status())));
            }
            let reply: SubBotReply = response.json().await.map_err(|e| err(e.to_string()))?;
            debug!(
                flow = %request.flow_id,
                messages = reply.messages.len(),
                done = reply.done,
                "Sub-bot replied"
            );
            Ok(reply)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegate_url() {
        assert_eq!(
            delegate_url("https://bots.example.com/", "billing"),
            "https://bots.example.com/flows/billing/messages"
        );
    }

    #[test]
    fn test_reply_defaults() {
        let reply: SubBotReply = serde_json::from_str(r#"{"messages":["hi"]}"#).unwrap();
        assert_eq!(reply.messages, vec!["hi".to_string()]);
        assert!(!reply.done);
        assert!(reply.result.is_none());
    }
}
