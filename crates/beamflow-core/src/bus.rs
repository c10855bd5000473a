//! Alert/Event Bus: topic-based pub/sub for observers.
//!
//! Delivery is best-effort within a single process via `tokio::sync::broadcast`;
//! durable observers are expected to read the event table instead. There is no cross-process transport here, matching the
//! teacher's in-process-only admin surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// The type names requires be preserved verbatim so external
/// dashboards keep working.
pub mod message_type {
    pub const WORKFLOW_UPDATED: &str = "workflow_updated";
    pub const STEP_STARTED: &str = "step_started";
    pub const STEP_COMPLETED: &str = "step_completed";
    pub const STEP_FAILED: &str = "step_failed";
    pub const WORKFLOW_COMPLETED: &str = "workflow_completed";
    pub const WORKFLOW_FAILED: &str = "workflow_failed";
    pub const WORKFLOW_ABANDONED: &str = "workflow_abandoned";
    pub const SAGA_STEP_COMPENSATED: &str = "saga_step_compensated";
    pub const ALERT: &str = "alert";
    pub const CHAOS_EVENT: &str = "chaos_event";
    pub const CIRCUIT_BREAKER_STATE_CHANGE: &str = "circuit_breaker_state_change";
}

/// A message published on the bus: `{topic, type, payload, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Topic helpers matching named topics.
pub fn workflow_topic(id: &str) -> String {
    format!("workflow:{id}")
}

pub fn circuit_breaker_topic(name: &str) -> String {
    format!("circuit_breaker:{name}")
}

pub const TOPIC_WORKFLOWS: &str = "workflows";
pub const TOPIC_ALERTS: &str = "alerts";
pub const TOPIC_CHAOS_EVENTS: &str = "chaos:events";

/// The in-process broker. One channel per process; subscribers filter by
/// topic client-side, avoiding a map of channels that would need its own
/// lifecycle management.
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Publish a message. A publish with no subscribers is a no-op, not
    /// an error -- the bus has no durability obligation.
    pub fn publish(&self, topic: impl Into<String>, message_type: &str, payload: Value) {
        let msg = BusMessage {
            topic: topic.into(),
            message_type: message_type.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        let _ = self.sender.send(msg);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
