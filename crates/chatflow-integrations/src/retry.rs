use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use chatflow_core::config::RetryConfig;
use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::traits::{CompletionClient, CompletionRequest, CompletionResponse};
use chatflow_core::types::MediaRef;

/// A completion client that retries transient provider failures with backoff.
pub struct RetryingCompletionClient {
    inner: Box<dyn CompletionClient>,
    retry_config: RetryConfig,
}

impl RetryingCompletionClient {
    pub fn new(inner: Box<dyn CompletionClient>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &ChatflowError) -> bool {
    match e {
        ChatflowError::Integration { message, .. } => {
            message.contains("429")
                || message.contains("500")
                || message.contains("502")
                || message.contains("503")
                || message.contains("timeout")
                || message.contains("connection")
        }
        ChatflowError::IntegrationTimeout { .. } => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl CompletionClient for RetryingCompletionClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.complete(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying completion request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn synthesize(&self, text: &str, voice: &str) -> BoxFuture<'_, Result<MediaRef>> {
        self.inner.synthesize(text, voice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
        message: &'static str,
    }

    impl CompletionClient for Flaky {
        fn complete(&self, _request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < self.failures {
                    Err(ChatflowError::Integration {
                        target: "completion".into(),
                        message: self.message.into(),
                    })
                } else {
                    Ok(CompletionResponse { text: "ok".into() })
                }
            })
        }
    }

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingCompletionClient::new(
            Box::new(Flaky {
                failures: 2,
                calls: calls.clone(),
                message: "HTTP 503: busy",
            }),
            config(3),
        );
        let res = client.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(res.text, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingCompletionClient::new(
            Box::new(Flaky {
                failures: 10,
                calls: calls.clone(),
                message: "HTTP 429: slow down",
            }),
            config(1),
        );
        assert!(client.complete(CompletionRequest::default()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingCompletionClient::new(
            Box::new(Flaky {
                failures: 10,
                calls: calls.clone(),
                message: "HTTP 401: bad key",
            }),
            config(3),
        );
        assert!(client.complete(CompletionRequest::default()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let cfg = config(5);
        for attempt in 0..8 {
            assert!(calculate_backoff(attempt, &cfg) <= Duration::from_millis(120));
        }
    }
}
