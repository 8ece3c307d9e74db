//! In-process routing by address.
//!
//! [`MemoryNetwork`] maps addresses to handlers and passes every request and
//! response through the same JSON encoding the wire uses, so a service that
//! works here sees exactly the values it would see over QUIC.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use shallot_onion::forward::{ForwardError, HopTransport};
use shallot_types::network::MessageBody;
use shallot_types::Address;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::messages::{decode, encode, Request, Response};
use crate::service::{deliver_message, Fabric, RequestHandler, RequestSender, ServiceHandle};
use crate::{Result, TransportError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe view of a [`RequestHandler`].
trait ErasedHandler: Send + Sync {
    fn call(&self, request: Request) -> BoxFuture<'_, Response>;
}

impl<H: RequestHandler> ErasedHandler for H {
    fn call(&self, request: Request) -> BoxFuture<'_, Response> {
        Box::pin(self.handle(request))
    }
}

/// Address table shared by every service in one process.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<RwLock<HashMap<Address, Arc<dyn ErasedHandler>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handler` at `at`. Fails if the address is taken.
    pub async fn bind<H: RequestHandler>(&self, at: Address, handler: Arc<H>) -> Result<()> {
        let mut routes = self.routes.write().await;
        if routes.contains_key(&at) {
            return Err(TransportError::Connection(format!(
                "address {at} already in use"
            )));
        }
        routes.insert(at, handler);
        debug!(address = %at, "Memory route bound");
        Ok(())
    }

    /// Detach whatever is at `at`.
    pub async fn unbind(&self, at: Address) {
        self.routes.write().await.remove(&at);
    }

    /// Whether anything answers at `at`.
    pub async fn is_bound(&self, at: Address) -> bool {
        self.routes.read().await.contains_key(&at)
    }

    /// Send one request to `to`.
    pub async fn request(&self, to: Address, request: Request) -> Result<Response> {
        let handler = self
            .routes
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(format!("nothing bound at {to}")))?;

        trace!(to = %to, kind = request.kind(), "Memory request");
        let request: Request = decode(&encode(&request)?)?;
        let response = handler.call(request).await;
        decode(&encode(&response)?)
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork").finish_non_exhaustive()
    }
}

impl RequestSender for MemoryNetwork {
    fn request(
        &self,
        to: Address,
        request: Request,
    ) -> impl Future<Output = Result<Response>> + Send {
        MemoryNetwork::request(self, to, request)
    }
}

impl HopTransport for MemoryNetwork {
    fn deliver(
        &self,
        to: Address,
        body: MessageBody,
    ) -> impl Future<Output = std::result::Result<(), ForwardError>> + Send {
        deliver_message(self, to, body)
    }
}

impl Fabric for MemoryNetwork {
    type Client = MemoryNetwork;

    fn open(&self, _at: Address) -> Result<Self::Client> {
        Ok(self.clone())
    }

    async fn serve<H: RequestHandler>(
        &self,
        _client: &Self::Client,
        at: Address,
        handler: Arc<H>,
    ) -> Result<ServiceHandle> {
        self.bind(at, handler).await?;
        Ok(ServiceHandle::memory(at, self.clone()))
    }
}
