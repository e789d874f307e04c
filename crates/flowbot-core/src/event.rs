use crate::types::FlowEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
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
    use crate::types::ConversationKey;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ignored() {
        let bus = EventBus::default();
        bus.publish(FlowEvent::ExecutionCompleted {
            key: ConversationKey::new("628111", "dev-1"),
            execution_id: "e1".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(FlowEvent::NodeEntered {
            key: ConversationKey::new("628111", "dev-1"),
            node_id: "n1".into(),
            kind: "message".into(),
        });
        match rx.recv().await.unwrap() {
            FlowEvent::NodeEntered { node_id, .. } => assert_eq!(node_id, "n1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
