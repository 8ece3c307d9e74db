//! Event emission system.
//!
//! Routers and users report hop and delivery events here as well as to
//! their own diagnostics. Subscribers each get an independent buffer; a
//! subscriber that falls behind loses the oldest events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shallot_onion::observe::{HopEvent, Observer, UserEvent};
use tokio::sync::broadcast;

/// Default subscriber buffer.
pub const DEFAULT_CAPACITY: usize = 1000;

/// An event emitted by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type name (e.g. "HopPeeled", "NetworkLaunched").
    pub event_type: String,
    /// Unix timestamp.
    pub timestamp: u64,
    /// Type-specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    /// Stamp a new event with the current time.
    pub fn now(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            payload,
        }
    }
}

/// Filter for event subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Category filter: "relay", "user", "system".
    pub categories: Option<Vec<String>>,
    /// Only events about these relays (payload `nodeId`).
    pub node_ids: Option<Vec<u32>>,
}

/// Event bus for broadcasting events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: Event) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Get the current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sequence", &self.sequence())
            .finish_non_exhaustive()
    }
}

impl Observer<HopEvent> for EventBus {
    fn observe(&self, event: &HopEvent) {
        let event = match event {
            HopEvent::Peeled {
                node_id,
                encrypted,
                decrypted,
                next,
            } => Event::now(
                "HopPeeled",
                serde_json::json!({
                    "nodeId": node_id,
                    "next": next,
                    "encryptedLen": encrypted.len(),
                    "decryptedLen": decrypted.len(),
                }),
            ),
            HopEvent::PeelFailed {
                node_id, reason, ..
            } => Event::now(
                "HopPeelFailed",
                serde_json::json!({ "nodeId": node_id, "reason": reason }),
            ),
            HopEvent::Forwarded { node_id, next } => Event::now(
                "HopForwarded",
                serde_json::json!({ "nodeId": node_id, "next": next }),
            ),
            HopEvent::ForwardFailed {
                node_id,
                next,
                reason,
            } => Event::now(
                "HopForwardFailed",
                serde_json::json!({ "nodeId": node_id, "next": next, "reason": reason }),
            ),
        };
        self.emit(event);
    }
}

impl Observer<UserEvent> for EventBus {
    fn observe(&self, event: &UserEvent) {
        let event = match event {
            UserEvent::Sent {
                user_id, circuit, ..
            } => Event::now(
                "UserMessageSent",
                serde_json::json!({ "userId": user_id, "circuit": circuit }),
            ),
            UserEvent::Received { user_id, message } => Event::now(
                "UserMessageReceived",
                serde_json::json!({ "userId": user_id, "length": message.len() }),
            ),
        };
        self.emit(event);
    }
}

impl EventFilter {
    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref categories) = self.categories {
            let event_category = categorize_event(&event.event_type);
            if !categories.iter().any(|c| c == event_category) {
                return false;
            }
        }

        // Events without a nodeId pass the node filter.
        if let Some(ref node_ids) = self.node_ids {
            if let Some(id) = event.payload.get("nodeId").and_then(|v| v.as_u64()) {
                if !node_ids.iter().any(|n| u64::from(*n) == id) {
                    return false;
                }
            }
        }

        true
    }
}

/// Categorize an event type into a category.
fn categorize_event(event_type: &str) -> &'static str {
    match event_type {
        s if s.starts_with("Hop") || s.starts_with("Relay") => "relay",
        s if s.starts_with("User") => "user",
        _ => "system",
    }
}
