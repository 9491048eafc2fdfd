use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::traits::ChannelAdapter;
use chatflow_core::types::{ContactId, InboundMessage, OutgoingMessage};

use crate::util::render_plain;

type Input = Box<dyn AsyncRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-oriented adapter for a single contact: every input line becomes an
/// inbound message, every outgoing message is printed. End of input closes
/// the adapter's sender.
pub struct ConsoleAdapter {
    channel: String,
    contact: ContactId,
    input: Mutex<Option<Input>>,
    output: tokio::sync::Mutex<Output>,
    prompt: String,
    cancel: CancellationToken,
}

impl ConsoleAdapter {
    /// Adapter over the process stdin and stdout.
    pub fn stdio(channel: &str, contact: ContactId) -> Self {
        Self::with_io(channel, contact, tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn with_io(
        channel: &str,
        contact: ContactId,
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            contact,
            input: Mutex::new(Some(Box::new(input))),
            output: tokio::sync::Mutex::new(Box::new(output)),
            prompt: "bot> ".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }
}

impl ChannelAdapter for ConsoleAdapter {
    fn name(&self) -> &str {
        &self.channel
    }

    fn start(&self, tx: mpsc::Sender<InboundMessage>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let input = self
                .input
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or_else(|| ChatflowError::Channel {
                    channel: self.channel.clone(),
                    message: "console adapter already started".into(),
                })?;

            let channel = self.channel.clone();
            let contact = self.contact.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(input).lines();
                loop {
                    let line = tokio::select! {
                        _ = cancel.cancelled() => break,
                        line = lines.next_line() => line,
                    };
                    match line {
                        Ok(Some(line)) => {
                            let body = line.trim();
                            if body.is_empty() {
                                continue;
                            }
                            let message = InboundMessage::text(&contact, &channel, body);
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(channel = %channel, "Console input closed");
                            break;
                        }
                        Err(e) => {
                            debug!(channel = %channel, error = %e, "Console read failed");
                            break;
                        }
                    }
                }
            });

            info!(channel = %self.channel, contact = %self.contact, "Console adapter started");
            Ok(())
        })
    }

    fn send(&self, message: &OutgoingMessage) -> BoxFuture<'_, Result<()>> {
        let text = format!("{}{}\n", self.prompt, render_plain(message));
        Box::pin(async move {
            let mut output = self.output.lock().await;
            output.write_all(text.as_bytes()).await?;
            output.flush().await?;
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        self.cancel.cancel();
        Box::pin(async { Ok(()) })
    }
}
