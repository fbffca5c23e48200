//! Observable connector events.
//!
//! Downstream dashboards key on the event names returned by
//! [`ConnectorEvent::name`], so those strings are part of the public contract.

use crate::connector::ConnectorState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectorEvent {
    MessagePublished {
        topic: String,
        message_id: String,
        producer: String,
        timestamp: DateTime<Utc>,
    },
    BatchPublished {
        topic: String,
        count: usize,
        producer: String,
        timestamp: DateTime<Utc>,
    },
    MessageConsumed {
        group_id: String,
        topic: String,
        partition: i32,
        offset: i64,
        timestamp: DateTime<Utc>,
    },
    MessageError {
        group_id: String,
        topic: String,
        partition: i32,
        offset: i64,
        error: String,
        dead_lettered: bool,
        timestamp: DateTime<Utc>,
    },
    ConsumerCrash {
        group_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ConsumerDisconnect {
        group_id: String,
        timestamp: DateTime<Utc>,
    },
    ProducerDisconnect {
        producer: String,
        timestamp: DateTime<Utc>,
    },
    StateChanged {
        from: ConnectorState,
        to: ConnectorState,
        timestamp: DateTime<Utc>,
    },
}

impl ConnectorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectorEvent::MessagePublished { .. } => "message:published",
            ConnectorEvent::BatchPublished { .. } => "batch:published",
            ConnectorEvent::MessageConsumed { .. } => "message:consumed",
            ConnectorEvent::MessageError { .. } => "message:error",
            ConnectorEvent::ConsumerCrash { .. } => "consumer:crash",
            ConnectorEvent::ConsumerDisconnect { .. } => "consumer:disconnect",
            ConnectorEvent::ProducerDisconnect { .. } => "producer:disconnect",
            ConnectorEvent::StateChanged { .. } => "connector:state",
        }
    }

    /// Consumer group the event belongs to, if any.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            ConnectorEvent::MessageConsumed { group_id, .. }
            | ConnectorEvent::MessageError { group_id, .. }
            | ConnectorEvent::ConsumerCrash { group_id, .. }
            | ConnectorEvent::ConsumerDisconnect { group_id, .. } => Some(group_id),
            _ => None,
        }
    }
}

/// Fan-out of [`ConnectorEvent`]s to any number of listeners.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConnectorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn emit(&self, event: ConnectorEvent) {
        trace!(event = event.name(), "emitting connector event");
        // No listeners is fine; events are advisory.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.sender.subscribe()
    }

    /// Stream view of the bus; lagged receivers yield an error item and continue.
    pub fn stream(&self) -> BroadcastStream<ConnectorEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = ConnectorEvent::ConsumerCrash {
            group_id: "alert-router".to_string(),
            error: "handler failed".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.name(), "consumer:crash");
        assert_eq!(event.group_id(), Some("alert-router"));

        let event = ConnectorEvent::ProducerDisconnect {
            producer: "default".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.name(), "producer:disconnect");
        assert_eq!(event.group_id(), None);
    }

    #[tokio::test]
    async fn test_emit_without_listeners() {
        let bus = EventBus::new();
        bus.emit(ConnectorEvent::ConsumerDisconnect {
            group_id: "g".to_string(),
            timestamp: Utc::now(),
        });

        let mut rx = bus.subscribe();
        bus.emit(ConnectorEvent::ConsumerDisconnect {
            group_id: "g2".to_string(),
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.group_id(), Some("g2"));
    }
}
