use std::time::Duration;

use base64::Engine;
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use sha2::Sha256;
use tracing::debug;

use chatflow_core::config::HttpConfig;
use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::flow::{HttpAuth, HttpMethod};
use chatflow_core::traits::{HttpClient, HttpRequest, HttpResponse};

/// Header carrying the body signature when a signing secret is configured.
pub const SIGNATURE_HEADER: &str = "X-Chatflow-Signature";

/// reqwest-backed HTTP client for webhook and API request nodes.
pub struct ReqwestHttpClient {
    http: Client,
}

impl ReqwestHttpClient {
    pub fn new(config: &HttpConfig) -> Self {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http }
    }
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign_body(secret: &str, body: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| {
        ChatflowError::Integration {
            target: "http".into(),
            message: format!("invalid signing secret: {}", e),
        }
    })?;
    mac.update(body.as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Header name and value for an auth scheme.
pub fn auth_header(auth: &HttpAuth) -> (String, String) {
    match auth {
        HttpAuth::Bearer { token } => ("Authorization".into(), format!("Bearer {}", token)),
        HttpAuth::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            ("Authorization".into(), format!("Basic {}", encoded))
        }
        HttpAuth::ApiKey { header, value } => (header.clone(), value.clone()),
    }
}

fn method(m: HttpMethod) -> Method {
    match m {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

impl HttpClient for ReqwestHttpClient {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let mut req = self
                .http
                .request(method(request.method), &request.url)
                .timeout(request.timeout);

            let has_content_type = request
                .headers
                .keys()
                .any(|k| k.eq_ignore_ascii_case("content-type"));
            for (k, v) in &request.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(auth) = &request.auth {
                let (name, value) = auth_header(auth);
                req = req.header(name, value);
            }

            let body = request.body.clone().unwrap_or_default();
            if let Some(secret) = &request.signing_secret {
                req = req.header(SIGNATURE_HEADER, sign_body(secret, &body)?);
            }
            if request.body.is_some() {
                if !has_content_type {
                    req = req.header("Content-Type", "application/json");
                }
                req = req.body(body);
            }

            let response = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    ChatflowError::IntegrationTimeout {
                        target: request.url.clone(),
                        timeout_secs: request.timeout.as_secs(),
                    }
                } else {
                    ChatflowError::Integration {
                        target: request.url.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| ChatflowError::Integration {
                    target: request.url.clone(),
                    message: e.to_string(),
                })?;
            debug!(url = %request.url, method = request.method.as_str(), status, "HTTP call finished");
            Ok(HttpResponse { status, body })
        })
    }
}
