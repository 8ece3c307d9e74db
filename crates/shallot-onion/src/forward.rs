//! The transport contract relays and senders forward through.
//!
//! A delivery is a single attempt. Implementations must not retry or queue;
//! a caller that wants retries wraps its own policy around [`HopTransport`].

use std::future::Future;
use std::sync::Arc;

use shallot_types::network::MessageBody;
use shallot_types::Address;

/// A failed delivery to the next hop or final recipient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("forwarding to {to} failed: {reason}")]
pub struct ForwardError {
    pub to: Address,
    pub reason: String,
}

impl ForwardError {
    pub fn new(to: Address, reason: impl Into<String>) -> Self {
        Self {
            to,
            reason: reason.into(),
        }
    }
}

/// Delivers a message body to an address.
///
/// Implementors provide the actual network I/O, which keeps the relay logic
/// testable without sockets.
pub trait HopTransport: Send + Sync {
    /// Make one attempt to deliver `body` to `to`.
    fn deliver(
        &self,
        to: Address,
        body: MessageBody,
    ) -> impl Future<Output = Result<(), ForwardError>> + Send;
}

impl<T: HopTransport> HopTransport for Arc<T> {
    fn deliver(
        &self,
        to: Address,
        body: MessageBody,
    ) -> impl Future<Output = Result<(), ForwardError>> + Send {
        (**self).deliver(to, body)
    }
}
