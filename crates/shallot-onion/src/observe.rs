//! Injectable observation sinks.
//!
//! Routers and users report what they see to an [`Observer`] instead of
//! writing process-wide variables. [`LastSeen`] keeps the most recent
//! snapshot; every event replaces it in one step, so a reader never sees
//! fields from two different messages. Under concurrent delivery the
//! winner is whichever event lands last.

use std::sync::Arc;

use shallot_types::diagnostics::{RelayDiagnostics, UserDiagnostics};
use shallot_types::{Address, NodeId, UserId};
use tokio::sync::watch;

/// Something that happened at a relay while handling one inbound blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HopEvent {
    /// A layer was removed.
    Peeled {
        node_id: NodeId,
        encrypted: String,
        decrypted: String,
        next: Address,
    },
    /// The layer could not be removed; nothing was forwarded.
    PeelFailed {
        node_id: NodeId,
        encrypted: String,
        reason: String,
    },
    /// The single forwarding attempt succeeded.
    Forwarded { node_id: NodeId, next: Address },
    /// The single forwarding attempt failed.
    ForwardFailed {
        node_id: NodeId,
        next: Address,
        reason: String,
    },
}

/// Something that happened at a user agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserEvent {
    /// An onion left for the entry relay.
    Sent {
        user_id: UserId,
        message: String,
        circuit: Vec<NodeId>,
    },
    /// A message arrived from an exit relay.
    Received { user_id: UserId, message: String },
}

/// A sink for events of type `E`.
pub trait Observer<E>: Send + Sync {
    fn observe(&self, event: &E);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl<E> Observer<E> for NoopObserver {
    fn observe(&self, _event: &E) {}
}

impl<E, T: Observer<E> + ?Sized> Observer<E> for Arc<T> {
    fn observe(&self, event: &E) {
        (**self).observe(event);
    }
}

/// Reports to both sinks, first then second.
impl<E, A: Observer<E>, B: Observer<E>> Observer<E> for (A, B) {
    fn observe(&self, event: &E) {
        self.0.observe(event);
        self.1.observe(event);
    }
}

/// Keeps the latest diagnostics snapshot.
pub struct LastSeen<S> {
    tx: watch::Sender<S>,
}

impl<S: Clone + Default> LastSeen<S> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(S::default());
        Self { tx }
    }

    /// Clone of the current snapshot.
    pub fn snapshot(&self) -> S {
        self.tx.borrow().clone()
    }

    /// Watch for snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }
}

impl<S: Clone + Default> Default for LastSeen<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer<HopEvent> for LastSeen<RelayDiagnostics> {
    fn observe(&self, event: &HopEvent) {
        match event {
            HopEvent::Peeled {
                encrypted,
                decrypted,
                next,
                ..
            } => {
                self.tx.send_replace(RelayDiagnostics {
                    last_received_encrypted_message: Some(encrypted.clone()),
                    last_received_decrypted_message: Some(decrypted.clone()),
                    last_message_destination: Some(*next),
                });
            }
            HopEvent::PeelFailed { encrypted, .. } => {
                self.tx.send_replace(RelayDiagnostics {
                    last_received_encrypted_message: Some(encrypted.clone()),
                    last_received_decrypted_message: None,
                    last_message_destination: None,
                });
            }
            HopEvent::Forwarded { .. } | HopEvent::ForwardFailed { .. } => {}
        }
    }
}

impl Observer<UserEvent> for LastSeen<UserDiagnostics> {
    fn observe(&self, event: &UserEvent) {
        match event {
            UserEvent::Sent {
                message, circuit, ..
            } => self.tx.send_modify(|d| {
                d.last_sent_message = Some(message.clone());
                d.last_circuit = circuit.clone();
            }),
            UserEvent::Received { message, .. } => self.tx.send_modify(|d| {
                d.last_received_message = Some(message.clone());
            }),
        }
    }
}
