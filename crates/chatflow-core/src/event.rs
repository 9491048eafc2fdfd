use tokio::sync::broadcast;

use crate::types::FlowEvent;

/// Broadcast bus for engine lifecycle events.
/// All subscribers receive all events; slow subscribers lag, they never block the engine.
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContactId, FlowId, PairKey};

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let pair = PairKey::new(FlowId::from_str("f"), ContactId::from_str("c"));
        bus.publish(FlowEvent::RunStarted {
            pair: pair.clone(),
            flow_version: 2,
        });
        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                FlowEvent::RunStarted { pair: p, flow_version } => {
                    assert_eq!(p, pair);
                    assert_eq!(flow_version, 2);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(FlowEvent::RunCompleted {
            pair: PairKey::new(FlowId::from_str("f"), ContactId::from_str("c")),
            steps: 1,
        });
    }
}
