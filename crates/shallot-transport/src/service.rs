//! Service-side and client-side traits, independent of the wire.
//!
//! A [`Fabric`] hands out clients bound to an address and attaches
//! [`RequestHandler`]s to addresses. The daemon is written against these
//! traits and runs unchanged over QUIC or in memory.

use std::future::Future;
use std::sync::Arc;

use shallot_onion::forward::{ForwardError, HopTransport};
use shallot_types::network::MessageBody;
use shallot_types::Address;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::memory::MemoryNetwork;
use crate::messages::{Request, Response};
use crate::quic::QuicEndpoint;
use crate::Result;

/// Answers requests arriving at one address.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the single response to `request`. Failures become
    /// [`Response::Error`]; the handler never drops a request silently.
    fn handle(&self, request: Request) -> impl Future<Output = Response> + Send;
}

/// Sends one request and waits for its response.
pub trait RequestSender: Send + Sync {
    fn request(
        &self,
        to: Address,
        request: Request,
    ) -> impl Future<Output = Result<Response>> + Send;
}

/// Something services can be attached to.
pub trait Fabric: Send + Sync + 'static {
    /// Client that sends from an opened address.
    type Client: RequestSender + HopTransport + Clone + 'static;

    /// Claim `at` and return a client for the service that will live there.
    fn open(&self, at: Address) -> Result<Self::Client>;

    /// Start answering requests at `at` with `handler`.
    fn serve<H: RequestHandler>(
        &self,
        client: &Self::Client,
        at: Address,
        handler: Arc<H>,
    ) -> impl Future<Output = Result<ServiceHandle>> + Send;
}

/// Deliver `body` as a [`Request::Message`], once.
///
/// Shared by every client's [`HopTransport`] implementation.
pub async fn deliver_message<S: RequestSender>(
    sender: &S,
    to: Address,
    body: MessageBody,
) -> std::result::Result<(), ForwardError> {
    match sender.request(to, Request::Message(body)).await {
        Ok(response) => response
            .expect_ok()
            .map_err(|e| ForwardError::new(to, e.to_string())),
        Err(e) => Err(ForwardError::new(to, e.to_string())),
    }
}

/// A running service. Dropping the handle leaves it running; call
/// [`ServiceHandle::stop`].
pub struct ServiceHandle {
    address: Address,
    stop: Stop,
}

enum Stop {
    Memory(MemoryNetwork),
    Quic {
        endpoint: Arc<QuicEndpoint>,
        task: JoinHandle<()>,
    },
}

impl ServiceHandle {
    pub(crate) fn memory(address: Address, network: MemoryNetwork) -> Self {
        Self {
            address,
            stop: Stop::Memory(network),
        }
    }

    pub(crate) fn quic(address: Address, endpoint: Arc<QuicEndpoint>, task: JoinHandle<()>) -> Self {
        Self {
            address,
            stop: Stop::Quic { endpoint, task },
        }
    }

    /// Where the service answers.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Stop answering. In-flight requests on QUIC are cut off.
    pub async fn stop(self) {
        match self.stop {
            Stop::Memory(network) => network.unbind(self.address).await,
            Stop::Quic { endpoint, task } => {
                endpoint.close(0, b"shutdown");
                if let Err(e) = task.await {
                    warn!(address = %self.address, error = %e, "Serve task ended abnormally");
                }
            }
        }
        debug!(address = %self.address, "Service stopped");
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.stop {
            Stop::Memory(_) => "memory",
            Stop::Quic { .. } => "quic",
        };
        f.debug_struct("ServiceHandle")
            .field("address", &self.address)
            .field("kind", &kind)
            .finish()
    }
}
