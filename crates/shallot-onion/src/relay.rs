//! Per-hop decrypt-and-forward.
//!
//! A relay keeps nothing between messages except its static key pair. Each
//! inbound blob goes through one transition:
//!
//! 1. **Split** at [`WRAPPED_KEY_B64_LEN`] into the wrapped key and the body.
//! 2. **Unwrap** the AES key with the relay's RSA private key.
//! 3. **Decrypt** the body and split off the ten-digit next address.
//! 4. **Forward** the remainder to that address, exactly once.
//!
//! The relay does not distinguish the exit case: the exit's next address is
//! the recipient, and the remainder it forwards is the plaintext message.

use std::fmt;
use std::sync::Arc;

use shallot_crypto::rsa_oaep::{self, KeyPair};
use shallot_crypto::{aes_cbc, CryptoError};
use shallot_types::network::MessageBody;
use shallot_types::{Address, NodeId};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::forward::HopTransport;
use crate::observe::{HopEvent, NoopObserver, Observer};
use crate::{OnionError, Result, WRAPPED_KEY_B64_LEN};

/// One layer removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeeledLayer {
    /// Where the remainder goes.
    pub next: Address,
    /// The inner onion, or the plaintext at the exit.
    pub remaining: String,
}

/// Terminal state of one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HopState {
    Delivered,
    DecryptionFailed,
    ForwardFailed,
}

impl HopState {
    /// Classify the result of [`RelayForwarder::handle`].
    pub fn of(result: &Result<Address>) -> Self {
        match result {
            Ok(_) => Self::Delivered,
            Err(OnionError::Forwarding(_)) => Self::ForwardFailed,
            Err(_) => Self::DecryptionFailed,
        }
    }
}

impl fmt::Display for HopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Delivered => "delivered",
            Self::DecryptionFailed => "decryption-failed",
            Self::ForwardFailed => "forward-failed",
        })
    }
}

/// The relay side of the protocol. Cheap to clone; clones share the key pair.
#[derive(Clone)]
pub struct RelayForwarder {
    node_id: NodeId,
    keys: Arc<KeyPair>,
    observer: Arc<dyn Observer<HopEvent>>,
}

impl RelayForwarder {
    /// Create a forwarder that reports to nobody.
    pub fn new(node_id: NodeId, keys: KeyPair) -> Self {
        Self {
            node_id,
            keys: Arc::new(keys),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Report hop events to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn Observer<HopEvent>>) -> Self {
        self.observer = observer;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The relay's public key as registered in the directory.
    pub fn public_key_b64(&self) -> Result<String> {
        Ok(self.keys.public_key_b64()?)
    }

    /// Remove this relay's layer from `blob`.
    ///
    /// Fails with [`OnionError::Crypto`] when the key cannot be unwrapped or
    /// the body cannot be decrypted, and with [`OnionError::MalformedOnion`]
    /// when the framing or the next address is wrong. CBC is unauthenticated,
    /// so a tampered body can also surface as a garbled address.
    pub fn peel(&self, blob: &str) -> Result<PeeledLayer> {
        let (key_part, body_part) = split_layer(blob)?;

        let sym_key = Zeroizing::new(rsa_oaep::decrypt(key_part, &self.keys.private_key)?);
        let plain = Zeroizing::new(aes_cbc::decrypt(&sym_key, body_part)?);

        let (next, remaining) = Address::split_prefix(&plain)
            .map_err(|e| OnionError::MalformedOnion(format!("next-hop address: {e}")))?;

        Ok(PeeledLayer {
            next,
            remaining: remaining.to_string(),
        })
    }

    /// Peel `blob` and make one attempt to forward the remainder.
    ///
    /// Returns the address the remainder was delivered to. Nothing is
    /// forwarded when peeling fails, and a failed forward is not retried.
    pub async fn handle<T: HopTransport>(
        &self,
        blob: &str,
        transport: &T,
    ) -> Result<Address> {
        let peeled = match self.peel(blob) {
            Ok(peeled) => peeled,
            Err(e) => {
                warn!(node_id = self.node_id, error = %e, "Failed to peel onion layer");
                self.observer.observe(&HopEvent::PeelFailed {
                    node_id: self.node_id,
                    encrypted: blob.to_string(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let next = peeled.next;
        self.observer.observe(&HopEvent::Peeled {
            node_id: self.node_id,
            encrypted: blob.to_string(),
            decrypted: peeled.remaining.clone(),
            next,
        });
        debug!(
            node_id = self.node_id,
            %next,
            remaining = peeled.remaining.len(),
            "Peeled layer"
        );

        let body = MessageBody {
            message: peeled.remaining,
        };
        match transport.deliver(next, body).await {
            Ok(()) => {
                self.observer.observe(&HopEvent::Forwarded {
                    node_id: self.node_id,
                    next,
                });
                Ok(next)
            }
            Err(e) => {
                warn!(node_id = self.node_id, %next, error = %e, "Forwarding failed");
                self.observer.observe(&HopEvent::ForwardFailed {
                    node_id: self.node_id,
                    next,
                    reason: e.reason.clone(),
                });
                Err(e.into())
            }
        }
    }
}

impl fmt::Debug for RelayForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayForwarder")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Split a layer into its fixed-width wrapped key and its body.
fn split_layer(blob: &str) -> Result<(&str, &str)> {
    if blob.len() <= WRAPPED_KEY_B64_LEN {
        return Err(OnionError::MalformedOnion(format!(
            "layer of {} characters is too short for a {WRAPPED_KEY_B64_LEN}-character key segment",
            blob.len()
        )));
    }
    if !blob.is_char_boundary(WRAPPED_KEY_B64_LEN) {
        // A valid key segment is pure base64, so this cannot be ours.
        return Err(OnionError::Crypto(CryptoError::Decryption(
            "key segment is not base64".to_string(),
        )));
    }
    Ok(blob.split_at(WRAPPED_KEY_B64_LEN))
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use shallot_types::diagnostics::RelayDiagnostics;
    use shallot_types::network::RelayRecord;
    use shallot_types::PortLayout;
    use tokio::sync::Mutex;

    use super::*;
    use crate::circuit::Circuit;
    use crate::forward::ForwardError;
    use crate::observe::LastSeen;
    use crate::onion::{build_onion, wrap_hop};

    fn keys() -> &'static [KeyPair] {
        static KEYS: OnceLock<Vec<KeyPair>> = OnceLock::new();
        KEYS.get_or_init(|| {
            (0..3)
                .map(|_| rsa_oaep::generate_key_pair().expect("keygen"))
                .collect()
        })
    }

    fn relays() -> Vec<RelayForwarder> {
        keys()
            .iter()
            .enumerate()
            .map(|(i, kp)| RelayForwarder::new(i as NodeId + 1, kp.clone()))
            .collect()
    }

    fn circuit_of(relays: &[RelayForwarder]) -> Circuit {
        Circuit::new(
            relays
                .iter()
                .map(|r| RelayRecord {
                    id: r.node_id(),
                    public_key: r.public_key_b64().expect("export"),
                })
                .collect(),
        )
        .expect("circuit")
    }

    /// Records deliveries; optionally refuses them.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Address, MessageBody)>>,
        refuse: bool,
    }

    impl HopTransport for RecordingTransport {
        async fn deliver(&self, to: Address, body: MessageBody) -> std::result::Result<(), ForwardError> {
            if self.refuse {
                return Err(ForwardError::new(to, "connection refused"));
            }
            self.sent.lock().await.push((to, body));
            Ok(())
        }
    }

    impl RecordingTransport {
        async fn take_last(&self) -> (Address, MessageBody) {
            self.sent.lock().await.pop().expect("one delivery")
        }
    }

    #[tokio::test]
    async fn test_three_hop_end_to_end() {
        let layout = PortLayout::default();
        let relays = relays();
        let final_addr = Address::from_port(3001);
        let onion = build_onion(&circuit_of(&relays), &layout, final_addr, "hello").expect("build");

        let transport = RecordingTransport::default();
        let mut blob = onion.blob;
        let mut to = onion.entry;
        for relay in &relays {
            assert_eq!(to, layout.relay_address(relay.node_id()).expect("addr"));
            let next = relay.handle(&blob, &transport).await.expect("handle");
            let (addr, body) = transport.take_last().await;
            assert_eq!(addr, next);
            blob = body.message;
            to = addr;
        }

        assert_eq!(to, final_addr);
        assert_eq!(blob, "hello");
    }

    #[test]
    fn test_peel_middle_layer() {
        let relay = &relays()[1];
        let inner = "opaque inner onion";
        let layer = wrap_hop(
            &relay.public_key_b64().expect("export"),
            Address::from_port(4003),
            inner,
        )
        .expect("wrap");

        let peeled = relay.peel(&layer).expect("peel");
        assert_eq!(peeled.next, Address::from_port(4003));
        assert_eq!(peeled.remaining, inner);
    }

    #[tokio::test]
    async fn test_corrupted_key_part_never_forwards() {
        let relays = relays();
        let onion = build_onion(
            &circuit_of(&relays),
            &PortLayout::default(),
            Address::from_port(3001),
            "hello",
        )
        .expect("build");

        for index in [0, 10, 171, 300] {
            let mut bytes = onion.blob.clone().into_bytes();
            bytes[index] = if bytes[index] == b'A' { b'B' } else { b'A' };
            let corrupted = String::from_utf8(bytes).expect("still ascii");

            let transport = RecordingTransport::default();
            let result = relays[0].handle(&corrupted, &transport).await;
            assert!(
                matches!(result, Err(OnionError::Crypto(CryptoError::Decryption(_)))),
                "flip at {index} gave {result:?}"
            );
            assert_eq!(HopState::of(&result), HopState::DecryptionFailed);
            assert!(transport.sent.lock().await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_wrong_relay_cannot_peel() {
        let relays = relays();
        let onion = build_onion(
            &circuit_of(&relays),
            &PortLayout::default(),
            Address::from_port(3001),
            "hello",
        )
        .expect("build");

        let transport = RecordingTransport::default();
        let result = relays[1].handle(&onion.blob, &transport).await;
        assert!(matches!(
            result,
            Err(OnionError::Crypto(CryptoError::Decryption(_)))
        ));
        assert!(transport.sent.lock().await.is_empty());
    }

    #[test]
    fn test_short_blob_is_malformed() {
        let relay = &relays()[0];
        assert!(matches!(relay.peel(""), Err(OnionError::MalformedOnion(_))));
        assert!(matches!(
            relay.peel(&"A".repeat(WRAPPED_KEY_B64_LEN)),
            Err(OnionError::MalformedOnion(_))
        ));
    }

    #[test]
    fn test_non_ascii_key_segment() {
        let relay = &relays()[0];
        let blob = format!("{}é{}", "A".repeat(WRAPPED_KEY_B64_LEN - 1), "rest");
        assert!(matches!(
            relay.peel(&blob),
            Err(OnionError::Crypto(CryptoError::Decryption(_)))
        ));
    }

    #[test]
    fn test_bad_address_prefix_is_malformed() {
        // Hand-build a layer whose plaintext does not start with ten digits.
        let relay = &relays()[0];
        let key = aes_cbc::SymmetricKey::generate();
        let body = aes_cbc::encrypt(&key, "abc");
        let wrapped =
            rsa_oaep::encrypt(&key.export(), &relay.public_key_b64().expect("export"))
                .expect("wrap key");
        let blob = format!("{wrapped}{body}");
        assert!(matches!(
            relay.peel(&blob),
            Err(OnionError::MalformedOnion(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_failure_is_reported_once() {
        let relays = relays();
        let layer = wrap_hop(
            &relays[2].public_key_b64().expect("export"),
            Address::from_port(3009),
            "plaintext",
        )
        .expect("wrap");

        let transport = RecordingTransport {
            refuse: true,
            ..Default::default()
        };
        let result = relays[2].handle(&layer, &transport).await;
        assert!(matches!(
            result,
            Err(OnionError::Forwarding(ForwardError { to, .. })) if to == Address::from_port(3009)
        ));
        assert_eq!(HopState::of(&result), HopState::ForwardFailed);
    }

    #[tokio::test]
    async fn test_observer_sees_hop() {
        let seen = Arc::new(LastSeen::<RelayDiagnostics>::new());
        let relay = relays()[0].clone().with_observer(seen.clone());
        let layer = wrap_hop(
            &relay.public_key_b64().expect("export"),
            Address::from_port(4002),
            "inner",
        )
        .expect("wrap");

        let transport = RecordingTransport::default();
        relay.handle(&layer, &transport).await.expect("handle");

        let snap = seen.snapshot();
        assert_eq!(snap.last_received_encrypted_message.as_deref(), Some(layer.as_str()));
        assert_eq!(snap.last_received_decrypted_message.as_deref(), Some("inner"));
        assert_eq!(snap.last_message_destination, Some(Address::from_port(4002)));
    }

    #[tokio::test]
    async fn test_concurrent_messages_at_one_relay() {
        let seen = Arc::new(LastSeen::<RelayDiagnostics>::new());
        let relay = relays()[0].clone().with_observer(seen.clone());
        let transport = Arc::new(RecordingTransport::default());
        let pk = relay.public_key_b64().expect("export");

        let mut handles = Vec::new();
        for n in 0..8u16 {
            let layer = wrap_hop(&pk, Address::from_port(3000 + n), &format!("msg-{n}"))
                .expect("wrap");
            let relay = relay.clone();
            let transport = Arc::clone(&transport);
            handles.push(tokio::spawn(async move {
                relay.handle(&layer, &*transport).await
            }));
        }
        for h in handles {
            h.await.expect("join").expect("delivered");
        }

        assert_eq!(transport.sent.lock().await.len(), 8);
        let snap = seen.snapshot();
        let dest = snap.last_message_destination.expect("destination").value();
        assert_eq!(
            snap.last_received_decrypted_message,
            Some(format!("msg-{}", dest - 3000))
        );
    }

    #[test]
    fn test_hop_state_display() {
        assert_eq!(HopState::Delivered.to_string(), "delivered");
        assert_eq!(HopState::DecryptionFailed.to_string(), "decryption-failed");
        assert_eq!(HopState::ForwardFailed.to_string(), "forward-failed");
    }
}
