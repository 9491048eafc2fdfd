use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tracing::{debug, info};

use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::traits::{ChannelAdapter, EffectSink};
use chatflow_core::types::{HandoffRecord, OutgoingMessage};

/// Effect sink that hands each outgoing message to the adapter registered
/// for its `channel_id`. Handoffs are logged for the ticketing side.
///
/// The engine is built with the sink before adapters exist, so adapters
/// register later through [`AdapterSink::register`].
#[derive(Default)]
pub struct AdapterSink {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl AdapterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let mut adapters = self.adapters.write().unwrap_or_else(|e| e.into_inner());
        adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn channels(&self) -> Vec<String> {
        let adapters = self.adapters.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = adapters.keys().cloned().collect();
        names.sort();
        names
    }

    fn adapter(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        let adapters = self.adapters.read().unwrap_or_else(|e| e.into_inner());
        adapters.get(channel).cloned()
    }
}

impl EffectSink for AdapterSink {
    fn deliver(&self, message: &OutgoingMessage) -> BoxFuture<'_, Result<()>> {
        let message = message.clone();
        Box::pin(async move {
            let adapter = self.adapter(&message.channel_id).ok_or_else(|| ChatflowError::Channel {
                channel: message.channel_id.clone(),
                message: "no adapter registered".into(),
            })?;
            debug!(channel = %message.channel_id, contact = %message.contact_id, "Delivering message");
            adapter.send(&message).await
        })
    }

    fn handoff(&self, record: &HandoffRecord) -> BoxFuture<'_, Result<()>> {
        info!(
            flow_id = %record.flow_id,
            contact = %record.contact_id,
            channel = %record.channel_id,
            target = %record.target,
            variables = record.variables.len(),
            "Conversation handed off"
        );
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chatflow_core::types::{ContactId, InboundMessage};
    use tokio::sync::mpsc;

    struct Collecting {
        name: String,
        sent: Mutex<Vec<String>>,
    }

    impl ChannelAdapter for Collecting {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn send(&self, message: &OutgoingMessage) -> BoxFuture<'_, Result<()>> {
            self.sent.lock().unwrap().push(message.content.clone());
            Box::pin(async { Ok(()) })
        }

        fn stop(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn routes_by_channel() {
        let sink = AdapterSink::new();
        let web = Arc::new(Collecting {
            name: "web".into(),
            sent: Mutex::new(vec![]),
        });
        sink.register(web.clone());
        assert_eq!(sink.channels(), vec!["web".to_string()]);

        let contact = ContactId::from_str("c1");
        sink.deliver(&OutgoingMessage::text(&contact, "web", "hello"))
            .await
            .unwrap();
        assert_eq!(*web.sent.lock().unwrap(), vec!["hello".to_string()]);

        let err = sink
            .deliver(&OutgoingMessage::text(&contact, "sms", "lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatflowError::Channel { ref channel, .. } if channel == "sms"));
    }
}
