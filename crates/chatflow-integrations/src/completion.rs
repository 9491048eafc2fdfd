use std::time::Duration;

use base64::Engine;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chatflow_core::config::{HttpConfig, LlmConfig};
use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::traits::{CompletionClient, CompletionRequest, CompletionResponse};
use chatflow_core::types::MediaRef;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI-compatible completion client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
///
/// `base_url` is the API root; `/chat/completions` and `/audio/speech` are appended.
pub struct OpenAiCompletionClient {
    http: Client,
    config: LlmConfig,
}

impl OpenAiCompletionClient {
    pub fn new(config: LlmConfig, http: &HttpConfig) -> Self {
        let client = Client::builder()
            .user_agent(http.user_agent.clone())
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http: client,
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.base_url.as_deref().unwrap_or(OPENAI_API_BASE);
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }
}

fn request_err(e: impl std::fmt::Display) -> ChatflowError {
    ChatflowError::Integration {
        target: "completion".into(),
        message: e.to_string(),
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn build_body(config: &LlmConfig, request: CompletionRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system_prompt {
        messages.push(OaiMessage {
            role: "system".into(),
            content: system,
        });
    }
    for m in request.messages {
        messages.push(OaiMessage {
            role: m.role,
            content: m.content,
        });
    }
    let temperature = request.temperature.unwrap_or(config.temperature);
    ChatRequest {
        model: request.model.unwrap_or_else(|| config.model_id.clone()),
        messages,
        max_tokens: request.max_tokens.unwrap_or(config.max_tokens),
        temperature: if temperature > 0.0 { Some(temperature) } else { None },
    }
}

impl CompletionClient for OpenAiCompletionClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let body = build_body(&self.config, request);
            let model = body.model.clone();
            let req = self.authorize(self.http.post(self.endpoint("chat/completions")).json(&body));

            let response = req.send().await.map_err(request_err)?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(request_err(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response.json().await.map_err(request_err)?;
            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| request_err("response has no choices"))?;
            debug!(model = %model, chars = text.len(), "Completion received");
            Ok(CompletionResponse { text })
        })
    }

    fn synthesize(&self, text: &str, voice: &str) -> BoxFuture<'_, Result<MediaRef>> {
        let text = text.to_string();
        let voice = voice.to_string();
        Box::pin(async move {
            let body = SpeechRequest {
                model: "tts-1",
                input: &text,
                voice: &voice,
            };
            let req = self.authorize(self.http.post(self.endpoint("audio/speech")).json(&body));
            let response = req.send().await.map_err(request_err)?;
            if !response.status().is_success() {
                return Err(request_err(format!("speech HTTP {}", response.status())));
            }
            let bytes = response.bytes().await.map_err(request_err)?;
            Ok(audio_ref(&bytes))
        })
    }
}

/// Inline the synthesized audio as a data URL; the transport uploads it.
fn audio_ref(bytes: &[u8]) -> MediaRef {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    MediaRef {
        url: format!("data:audio/mpeg;base64,{}", encoded),
        mime_type: Some("audio/mpeg".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::traits::CompletionMessage;

    fn config() -> LlmConfig {
        toml::from_str::<LlmConfig>("model_id = \"gpt-4o-mini\"").unwrap()
    }

    #[test]
    fn test_body_uses_config_defaults() {
        let body = build_body(
            &config(),
            CompletionRequest {
                system_prompt: Some("be brief".into()),
                messages: vec![CompletionMessage {
                    role: "user".into(),
                    content: "hi".into(),
                }],
                ..Default::default()
            },
        );
        assert_eq!(body.model, "gpt-4o-mini");
        assert_eq!(body.max_tokens, 1024);
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
    }

    #[test]
    fn test_body_overrides() {
        let body = build_body(
            &config(),
            CompletionRequest {
                model: Some("llama3".into()),
                temperature: Some(0.0),
                max_tokens: Some(50),
                ..Default::default()
            },
        );
        assert_eq!(body.model, "llama3");
        assert_eq!(body.max_tokens, 50);
        assert!(body.temperature.is_none());
    }

    #[test]
    fn test_endpoint_joins_base() {
        let mut cfg = config();
        cfg.base_url = Some("http://localhost:11434/v1/".into());
        let client = OpenAiCompletionClient::new(cfg, &HttpConfig::default());
        assert_eq!(
            client.endpoint("chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_audio_ref_is_data_url() {
        let media = audio_ref(b"abc");
        assert_eq!(media.url, "data:audio/mpeg;base64,YWJj");
    }
}
