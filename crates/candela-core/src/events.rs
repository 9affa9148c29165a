//! Mutation bus connecting the per-kind stores to downstream consumers.
//!
//! Stores never call the subscription engine directly: every accepted
//! mutation is published here after the store lock is released, and the
//! subscription engine (plus façade-level registration hooks) consume the
//! stream from their own tasks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::time::FhirInstant;

/// Default buffer size for the broadcast channel. Slow receivers beyond this
/// lag are dropped by tokio's broadcast semantics.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// The three store mutations observable on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One accepted store mutation, with before/after payloads where they exist.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub mutation: MutationKind,
    pub kind: String,
    pub id: String,
    pub version: u64,
    /// Payload before the mutation (absent for creates).
    pub previous: Option<Value>,
    /// Payload after the mutation (absent for deletes).
    pub current: Option<Value>,
    pub timestamp: FhirInstant,
}

impl MutationEvent {
    pub fn created(kind: impl Into<String>, id: impl Into<String>, current: Value, version: u64) -> Self {
        Self {
            mutation: MutationKind::Created,
            kind: kind.into(),
            id: id.into(),
            version,
            previous: None,
            current: Some(current),
            timestamp: FhirInstant::now(),
        }
    }

    pub fn updated(
        kind: impl Into<String>,
        id: impl Into<String>,
        previous: Value,
        current: Value,
        version: u64,
    ) -> Self {
        Self {
            mutation: MutationKind::Updated,
            kind: kind.into(),
            id: id.into(),
            version,
            previous: Some(previous),
            current: Some(current),
            timestamp: FhirInstant::now(),
        }
    }

    pub fn deleted(kind: impl Into<String>, id: impl Into<String>, previous: Value, version: u64) -> Self {
        Self {
            mutation: MutationKind::Deleted,
            kind: kind.into(),
            id: id.into(),
            version,
            previous: Some(previous),
            current: None,
            timestamp: FhirInstant::now(),
        }
    }

    /// The payload most representative of the mutation: the new state, or
    /// the last known state for deletes.
    pub fn focus(&self) -> Option<&Value> {
        self.current.as_ref().or(self.previous.as_ref())
    }
}

/// Broadcast bus for mutation events.
///
/// Cloneable; multiple subscribers each see every event published after they
/// subscribed.
#[derive(Clone)]
pub struct MutationBus {
    sender: broadcast::Sender<MutationEvent>,
}

impl MutationBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; returns the number of receivers that saw it.
    pub fn publish(&self, event: MutationEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MutationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MutationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = MutationBus::new();
        let sent = bus.publish(MutationEvent::created("Patient", "p1", json!({}), 1));
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = MutationBus::new();
        let mut rx = bus.subscribe();

        bus.publish(MutationEvent::created("Patient", "p1", json!({"id": "p1"}), 1));
        bus.publish(MutationEvent::updated(
            "Patient",
            "p1",
            json!({"id": "p1"}),
            json!({"id": "p1", "active": true}),
            2,
        ));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.mutation, MutationKind::Created);
        assert_eq!(first.version, 1);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.mutation, MutationKind::Updated);
        assert!(second.previous.is_some());
        assert!(second.current.is_some());
    }

    #[test]
    fn focus_prefers_current_state() {
        let updated = MutationEvent::updated("Patient", "p", json!({"a": 1}), json!({"a": 2}), 2);
        assert_eq!(updated.focus().unwrap()["a"], 2);

        let deleted = MutationEvent::deleted("Patient", "p", json!({"a": 1}), 2);
        assert_eq!(deleted.focus().unwrap()["a"], 1);
    }
}
