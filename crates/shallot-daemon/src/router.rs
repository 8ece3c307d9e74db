//! Onion router service.
//!
//! A router generates its key pair at start, registers once with the
//! registry, then peels and forwards whatever arrives. Keys live only in
//! memory; a restarted router is a new router.

use std::sync::Arc;

use shallot_crypto::rsa_oaep::{self, KeyPair};
use shallot_onion::forward::HopTransport;
use shallot_onion::observe::{HopEvent, LastSeen, Observer};
use shallot_onion::relay::{HopState, RelayForwarder};
use shallot_transport::messages::{Diagnostics, Request, Response};
use shallot_transport::{RequestHandler, RequestSender};
use shallot_types::diagnostics::RelayDiagnostics;
use shallot_types::network::RelayRecord;
use shallot_types::{Address, NodeId, PortLayout};
use tracing::{debug, info};

use crate::events::EventBus;
use crate::{DaemonError, Result};

/// One onion router.
pub struct RouterService<C> {
    forwarder: RelayForwarder,
    client: C,
    layout: PortLayout,
    diagnostics: Arc<LastSeen<RelayDiagnostics>>,
}

/// Generate an RSA key pair off the async runtime.
pub async fn generate_keys() -> Result<KeyPair> {
    tokio::task::spawn_blocking(rsa_oaep::generate_key_pair)
        .await
        .map_err(|e| DaemonError::Task(e.to_string()))?
        .map_err(DaemonError::from)
}

impl<C> RouterService<C>
where
    C: RequestSender + HopTransport + 'static,
{
    /// Build a router around an existing key pair.
    pub fn new(node_id: NodeId, keys: KeyPair, client: C, layout: PortLayout, events: EventBus) -> Self {
        let diagnostics = Arc::new(LastSeen::<RelayDiagnostics>::new());
        let observer: Arc<dyn Observer<HopEvent>> = Arc::new((Arc::clone(&diagnostics), events));
        Self {
            forwarder: RelayForwarder::new(node_id, keys).with_observer(observer),
            client,
            layout,
            diagnostics,
        }
    }

    /// Build a router with a freshly generated key pair.
    pub async fn start(node_id: NodeId, client: C, layout: PortLayout, events: EventBus) -> Result<Self> {
        let keys = generate_keys().await?;
        debug!(node_id, "Router key pair generated");
        Ok(Self::new(node_id, keys, client, layout, events))
    }

    pub fn node_id(&self) -> NodeId {
        self.forwarder.node_id()
    }

    /// Where this router listens.
    pub fn address(&self) -> Result<Address> {
        Ok(self.layout.relay_address(self.node_id())?)
    }

    pub fn public_key_b64(&self) -> Result<String> {
        Ok(self.forwarder.public_key_b64()?)
    }

    /// Current last-seen snapshot.
    pub fn diagnostics(&self) -> RelayDiagnostics {
        self.diagnostics.snapshot()
    }

    /// Register with the registry. One attempt; the caller decides what a
    /// failure means.
    pub async fn register(&self) -> Result<()> {
        let record = RelayRecord {
            id: self.node_id(),
            public_key: self.public_key_b64()?,
        };
        self.client
            .request(self.layout.registry_address(), Request::RegisterNode(record))
            .await?
            .expect_ok()?;
        info!(node_id = self.node_id(), "Registered with registry");
        Ok(())
    }

    async fn on_message(&self, blob: &str) -> Response {
        let result = self.forwarder.handle(blob, &self.client).await;
        debug!(
            node_id = self.node_id(),
            state = %HopState::of(&result),
            "Message handled"
        );
        match result {
            Ok(_) => Response::Ok,
            Err(e) => Response::error(e),
        }
    }
}

impl<C> RequestHandler for RouterService<C>
where
    C: RequestSender + HopTransport + 'static,
{
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Status => Response::Live,
            Request::Message(body) => self.on_message(&body.message).await,
            Request::GetDiagnostics => Response::Diagnostics(Diagnostics::Relay(self.diagnostics())),
            other => Response::unsupported(&other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use shallot_onion::onion::wrap_hop;
    use shallot_transport::memory::MemoryNetwork;
    use shallot_types::network::MessageBody;

    use super::*;
    use crate::registry::RegistryService;

    fn keys() -> &'static KeyPair {
        static KEYS: OnceLock<KeyPair> = OnceLock::new();
        KEYS.get_or_init(|| rsa_oaep::generate_key_pair().expect("keygen"))
    }

    /// Records the last plaintext it was handed.
    #[derive(Default)]
    struct Inbox {
        last: tokio::sync::Mutex<Option<String>>,
    }

    impl RequestHandler for Inbox {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Message(MessageBody { message }) => {
                    *self.last.lock().await = Some(message);
                    Response::Ok
                }
                other => Response::unsupported(&other),
            }
        }
    }

    fn router(net: &MemoryNetwork) -> RouterService<MemoryNetwork> {
        RouterService::new(
            1,
            keys().clone(),
            net.clone(),
            PortLayout::default(),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_register_once() {
        let net = MemoryNetwork::new();
        let layout = PortLayout::default();
        let registry = Arc::new(RegistryService::new());
        net.bind(layout.registry_address(), Arc::clone(&registry))
            .await
            .expect("bind");

        let router = router(&net);
        router.register().await.expect("register");

        let nodes = registry.directory().list_all().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, 1);
        assert_eq!(nodes[0].public_key, router.public_key_b64().expect("key"));
    }

    #[tokio::test]
    async fn test_register_without_registry_fails() {
        let net = MemoryNetwork::new();
        let result = router(&net).register().await;
        assert!(matches!(result, Err(DaemonError::Transport(_))));
    }

    #[tokio::test]
    async fn test_message_is_peeled_and_forwarded() {
        let net = MemoryNetwork::new();
        let inbox = Arc::new(Inbox::default());
        let dest = Address::from_port(3001);
        net.bind(dest, Arc::clone(&inbox)).await.expect("bind");

        let router = router(&net);
        let layer = wrap_hop(&router.public_key_b64().expect("key"), dest, "hello")
            .expect("wrap");
        let resp = router
            .handle(Request::Message(MessageBody {
                message: layer.clone(),
            }))
            .await;
        assert_eq!(resp, Response::Ok);
        assert_eq!(inbox.last.lock().await.as_deref(), Some("hello"));

        let diag = router.diagnostics();
        assert_eq!(diag.last_received_encrypted_message.as_deref(), Some(layer.as_str()));
        assert_eq!(diag.last_received_decrypted_message.as_deref(), Some("hello"));
        assert_eq!(diag.last_message_destination, Some(dest));
    }

    #[tokio::test]
    async fn test_undecryptable_message_is_rejected() {
        let net = MemoryNetwork::new();
        let router = router(&net);
        let resp = router
            .handle(Request::Message(MessageBody {
                message: "A".repeat(400),
            }))
            .await;
        assert!(matches!(resp, Response::Error { .. }));

        let diag = router.diagnostics();
        assert!(diag.last_received_encrypted_message.is_some());
        assert!(diag.last_message_destination.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_next_hop_is_reported() {
        let net = MemoryNetwork::new();
        let router = router(&net);
        let layer = wrap_hop(
            &router.public_key_b64().expect("key"),
            Address::from_port(3999),
            "lost",
        )
        .expect("wrap");
        let resp = router
            .handle(Request::Message(MessageBody { message: layer }))
            .await;
        assert!(matches!(resp, Response::Error { message } if message.contains("0000003999")));
    }

    #[tokio::test]
    async fn test_diagnostics_request() {
        let net = MemoryNetwork::new();
        let resp = router(&net).handle(Request::GetDiagnostics).await;
        assert_eq!(
            resp,
            Response::Diagnostics(Diagnostics::Relay(RelayDiagnostics::default()))
        );
    }
}
