//! User agent service.
//!
//! A user sends by fetching the directory, drawing a fresh circuit, layering
//! the message and handing the onion to the entry relay. It receives by
//! accepting plaintext `Message` requests from exit relays.

use std::sync::Arc;

use shallot_onion::circuit::select_circuit;
use shallot_onion::forward::HopTransport;
use shallot_onion::observe::{LastSeen, Observer, UserEvent};
use shallot_onion::onion::build_onion;
use shallot_onion::OnionError;
use shallot_transport::messages::{Diagnostics, Request, Response};
use shallot_transport::{RequestHandler, RequestSender};
use shallot_types::diagnostics::UserDiagnostics;
use shallot_types::network::MessageBody;
use shallot_types::{Address, NodeId, PortLayout, UserId};
use tracing::{info, warn};

use crate::events::EventBus;
use crate::Result;

/// One user agent.
pub struct UserService<C> {
    user_id: UserId,
    client: C,
    layout: PortLayout,
    circuit_length: usize,
    diagnostics: Arc<LastSeen<UserDiagnostics>>,
    observer: Arc<dyn Observer<UserEvent>>,
}

impl<C> UserService<C>
where
    C: RequestSender + HopTransport + 'static,
{
    pub fn new(
        user_id: UserId,
        client: C,
        layout: PortLayout,
        circuit_length: usize,
        events: EventBus,
    ) -> Self {
        let diagnostics = Arc::new(LastSeen::<UserDiagnostics>::new());
        let observer: Arc<dyn Observer<UserEvent>> = Arc::new((Arc::clone(&diagnostics), events));
        Self {
            user_id,
            client,
            layout,
            circuit_length,
            diagnostics,
            observer,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Where this user listens.
    pub fn address(&self) -> Result<Address> {
        Ok(self.layout.user_address(self.user_id)?)
    }

    /// Current last-seen snapshot.
    pub fn diagnostics(&self) -> UserDiagnostics {
        self.diagnostics.snapshot()
    }

    /// Send `message` to user `destination` through a fresh circuit.
    ///
    /// Returns the circuit's relay ids, entry first. The onion is handed to
    /// the entry relay once; a failure anywhere along the path surfaces here
    /// and nothing is recorded as sent.
    pub async fn send_message(&self, message: &str, destination: UserId) -> Result<Vec<NodeId>> {
        let registry = self
            .client
            .request(self.layout.registry_address(), Request::GetNodeRegistry)
            .await?
            .expect_registry()?;

        let circuit = select_circuit(&registry.nodes, self.circuit_length)?;
        let final_address = self.layout.user_address(destination)?;
        let onion = build_onion(&circuit, &self.layout, final_address, message)?;

        self.client
            .deliver(
                onion.entry,
                MessageBody {
                    message: onion.blob,
                },
            )
            .await
            .map_err(OnionError::from)?;

        let ids = circuit.node_ids();
        info!(
            user_id = self.user_id,
            destination,
            circuit = ?ids,
            "Message sent"
        );
        self.observer.observe(&UserEvent::Sent {
            user_id: self.user_id,
            message: message.to_string(),
            circuit: ids.clone(),
        });
        Ok(ids)
    }

    /// Record a message delivered by an exit relay.
    pub fn receive(&self, message: String) {
        info!(user_id = self.user_id, len = message.len(), "Message received");
        self.observer.observe(&UserEvent::Received {
            user_id: self.user_id,
            message,
        });
    }
}

impl<C> RequestHandler for UserService<C>
where
    C: RequestSender + HopTransport + 'static,
{
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Status => Response::Live,
            Request::Message(body) => {
                self.receive(body.message);
                Response::Ok
            }
            Request::SendMessage(body) => {
                match self
                    .send_message(&body.message, body.destination_user_id)
                    .await
                {
                    Ok(_) => Response::Ok,
                    Err(e) => {
                        warn!(user_id = self.user_id, error = %e, "Send failed");
                        Response::error(e)
                    }
                }
            }
            Request::GetDiagnostics => Response::Diagnostics(Diagnostics::User(self.diagnostics())),
            other => Response::unsupported(&other),
        }
    }
}

#[cfg(test)]
mod tests {
    use shallot_transport::memory::MemoryNetwork;
    use shallot_types::network::SendMessageBody;

    use super::*;
    use crate::registry::RegistryService;

    fn user(net: &MemoryNetwork, id: UserId) -> UserService<MemoryNetwork> {
        UserService::new(id, net.clone(), PortLayout::default(), 3, EventBus::default())
    }

    #[tokio::test]
    async fn test_receive_records_message() {
        let net = MemoryNetwork::new();
        let user = user(&net, 0);
        let resp = user
            .handle(Request::Message(MessageBody {
                message: "hi there".into(),
            }))
            .await;
        assert_eq!(resp, Response::Ok);
        assert_eq!(user.diagnostics().last_received_message.as_deref(), Some("hi there"));
        assert!(user.diagnostics().last_sent_message.is_none());
    }

    #[tokio::test]
    async fn test_send_with_empty_directory_fails_fast() {
        let net = MemoryNetwork::new();
        let layout = PortLayout::default();
        net.bind(layout.registry_address(), Arc::new(RegistryService::new()))
            .await
            .expect("bind");

        let user = user(&net, 0);
        let resp = user
            .handle(Request::SendMessage(SendMessageBody {
                message: "hello".into(),
                destination_user_id: 1,
            }))
            .await;
        assert!(matches!(resp, Response::Error { message } if message.contains("insufficient nodes")));
        assert!(user.diagnostics().last_sent_message.is_none());
        assert!(user.diagnostics().last_circuit.is_empty());
    }

    #[tokio::test]
    async fn test_send_through_undersized_relay_key_is_an_error() {
        let net = MemoryNetwork::new();
        let layout = PortLayout::default();
        net.bind(layout.registry_address(), Arc::new(RegistryService::new()))
            .await
            .expect("bind");

        let small = shallot_crypto::rsa_oaep::generate_key_pair_with_bits(512).expect("keygen");
        let resp = net
            .request(
                layout.registry_address(),
                Request::RegisterNode(shallot_types::network::RelayRecord {
                    id: 0,
                    public_key: small.public_key_b64().expect("export"),
                }),
            )
            .await
            .expect("register");
        assert_eq!(resp, Response::Ok);

        let user = UserService::new(0, net.clone(), layout, 1, EventBus::default());
        let resp = user
            .handle(Request::SendMessage(SendMessageBody {
                message: "hello".into(),
                destination_user_id: 1,
            }))
            .await;
        assert!(matches!(resp, Response::Error { message } if message.contains("framing requires 344")));
        assert!(user.diagnostics().last_sent_message.is_none());
    }

    #[tokio::test]
    async fn test_send_without_registry_fails() {
        let net = MemoryNetwork::new();
        let result = user(&net, 0).send_message("hello", 1).await;
        assert!(matches!(result, Err(crate::DaemonError::Transport(_))));
    }

    #[tokio::test]
    async fn test_address_and_diagnostics_request() {
        let net = MemoryNetwork::new();
        let user = user(&net, 1);
        assert_eq!(user.address().expect("address"), Address::from_port(3001));
        assert_eq!(
            user.handle(Request::GetDiagnostics).await,
            Response::Diagnostics(Diagnostics::User(UserDiagnostics::default()))
        );
    }
}
