//! Onion construction at the sender.
//!
//! Layers are applied from the exit outward. The exit's layer carries the
//! final recipient's address and the message; each earlier relay's layer
//! carries the address of the relay after it and the already-wrapped inner
//! onion. For a circuit `[r1, r2, r3]`:
//!
//! ```text
//! L3 = wrap(r3, final_address, message)
//! L2 = wrap(r2, addr(r3), L3)
//! L1 = wrap(r1, addr(r2), L2)     -> sent to addr(r1)
//! ```
//!
//! Every layer uses a fresh AES key that is dropped (and zeroized) as soon as
//! the layer is built.

use shallot_crypto::aes_cbc::{self, SymmetricKey};
use shallot_crypto::encoding::base64_len;
use shallot_crypto::rsa_oaep;
use shallot_types::network::RelayRecord;
use shallot_types::{Address, PortLayout, ADDRESS_WIDTH};
use tracing::debug;
use zeroize::Zeroizing;

use crate::circuit::Circuit;
use crate::{OnionError, Result, WRAPPED_KEY_B64_LEN};

/// A fully layered onion, ready for the entry relay.
#[derive(Clone, Debug)]
pub struct Onion {
    /// The outermost layer.
    pub blob: String,
    /// Where to send `blob`.
    pub entry: Address,
    /// The relays, in send order.
    pub circuit: Vec<RelayRecord>,
}

/// Encrypt one layer for the relay holding `public_key_b64`.
///
/// The result is `wrapped_key ++ base64(iv) ":" base64(ct)`, where the
/// plaintext of `ct` is `next.encode() ++ payload`. The relay key must have
/// the modulus the fixed-width framing assumes; any other size is
/// `KeySize` and nothing is encrypted.
pub fn wrap_hop(public_key_b64: &str, next: Address, payload: &str) -> Result<String> {
    let public_key = rsa_oaep::import_public_key(public_key_b64)?;
    let size = rsa_oaep::modulus_len(&public_key);
    if size != rsa_oaep::CIPHERTEXT_LEN {
        return Err(OnionError::KeySize {
            expected: WRAPPED_KEY_B64_LEN,
            actual: base64_len(size),
        });
    }

    let key = SymmetricKey::generate();

    let mut plain = Zeroizing::new(String::with_capacity(ADDRESS_WIDTH + payload.len()));
    plain.push_str(&next.encode());
    plain.push_str(payload);
    let body = aes_cbc::encrypt(&key, &plain);

    let exported = Zeroizing::new(key.export());
    let mut layer = rsa_oaep::encrypt_with_key(&exported, &public_key)?;
    layer.push_str(&body);
    Ok(layer)
}

/// Layer `message` for delivery to `final_address` through `circuit`.
pub fn build_onion(
    circuit: &Circuit,
    layout: &PortLayout,
    final_address: Address,
    message: &str,
) -> Result<Onion> {
    let mut payload = message.to_string();
    let mut next = final_address;

    for hop in circuit.hops().iter().rev() {
        payload = wrap_hop(&hop.public_key, next, &payload)?;
        next = layout.relay_address(hop.id)?;
    }

    debug!(
        hops = circuit.len(),
        entry = %next,
        size = payload.len(),
        "Built onion"
    );

    Ok(Onion {
        blob: payload,
        entry: next,
        circuit: circuit.hops().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use shallot_crypto::rsa_oaep::KeyPair;
    use shallot_crypto::CryptoError;

    use super::*;

    fn keys() -> &'static [KeyPair] {
        static KEYS: OnceLock<Vec<KeyPair>> = OnceLock::new();
        KEYS.get_or_init(|| {
            (0..3)
                .map(|_| rsa_oaep::generate_key_pair().expect("keygen"))
                .collect()
        })
    }

    fn circuit() -> Circuit {
        let hops = keys()
            .iter()
            .zip([7u32, 2, 5])
            .map(|(kp, id)| RelayRecord {
                id,
                public_key: kp.public_key_b64().expect("export"),
            })
            .collect();
        Circuit::new(hops).expect("circuit")
    }

    /// Remove one layer by hand, without going through the relay module.
    fn unwrap_layer(kp: &KeyPair, layer: &str) -> (Address, String) {
        let (key_part, body) = layer.split_at(WRAPPED_KEY_B64_LEN);
        let sym = rsa_oaep::decrypt(key_part, &kp.private_key).expect("unwrap key");
        let plain = aes_cbc::decrypt(&sym, body).expect("decrypt body");
        let (addr, rest) = Address::split_prefix(&plain).expect("address");
        (addr, rest.to_string())
    }

    #[test]
    fn test_wrap_hop_layout() {
        let kp = &keys()[0];
        let layer = wrap_hop(
            &kp.public_key_b64().expect("export"),
            Address::from_port(3001),
            "hi",
        )
        .expect("wrap");
        assert!(layer.len() > WRAPPED_KEY_B64_LEN);
        assert!(layer[WRAPPED_KEY_B64_LEN..].contains(':'));

        let (addr, rest) = unwrap_layer(kp, &layer);
        assert_eq!(addr, Address::from_port(3001));
        assert_eq!(rest, "hi");
    }

    #[test]
    fn test_build_onion_layer_order() {
        let layout = PortLayout::default();
        let circuit = circuit();
        let final_addr = Address::from_port(3001);
        let onion = build_onion(&circuit, &layout, final_addr, "hello").expect("build");

        assert_eq!(onion.entry, layout.relay_address(7).expect("addr"));
        assert_eq!(
            onion.circuit.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![7, 2, 5]
        );

        let (a1, l2) = unwrap_layer(&keys()[0], &onion.blob);
        assert_eq!(a1, layout.relay_address(2).expect("addr"));
        let (a2, l3) = unwrap_layer(&keys()[1], &l2);
        assert_eq!(a2, layout.relay_address(5).expect("addr"));
        let (a3, message) = unwrap_layer(&keys()[2], &l3);
        assert_eq!(a3, final_addr);
        assert_eq!(message, "hello");
    }

    #[test]
    fn test_layers_are_fresh_per_build() {
        let layout = PortLayout::default();
        let circuit = circuit();
        let a = build_onion(&circuit, &layout, Address::from_port(3000), "same").expect("build");
        let b = build_onion(&circuit, &layout, Address::from_port(3000), "same").expect("build");
        assert_ne!(a.blob, b.blob);
        assert_ne!(
            a.blob[..WRAPPED_KEY_B64_LEN],
            b.blob[..WRAPPED_KEY_B64_LEN]
        );
    }

    #[test]
    fn test_long_message() {
        let layout = PortLayout::default();
        let message = "x".repeat(10_000);
        let onion =
            build_onion(&circuit(), &layout, Address::from_port(3002), &message).expect("build");
        assert!(onion.blob.len() > message.len());
    }

    #[test]
    fn test_bad_relay_key() {
        let circuit = Circuit::new(vec![RelayRecord {
            id: 1,
            public_key: "bm90IGEga2V5".to_string(),
        }])
        .expect("circuit");
        let result = build_onion(
            &circuit,
            &PortLayout::default(),
            Address::from_port(3000),
            "hi",
        );
        assert!(matches!(
            result,
            Err(OnionError::Crypto(CryptoError::KeyFormat(_)))
        ));
    }

    fn key_of_bits(bits: usize) -> String {
        rsa_oaep::generate_key_pair_with_bits(bits)
            .expect("keygen")
            .public_key_b64()
            .expect("export")
    }

    #[test]
    fn test_wrong_key_size_is_rejected() {
        let small = key_of_bits(512);
        assert!(matches!(
            wrap_hop(&small, Address::from_port(3000), "hi"),
            Err(OnionError::KeySize { expected: 344, actual: 88 })
        ));

        let large = key_of_bits(4096);
        assert!(matches!(
            wrap_hop(&large, Address::from_port(3000), "hi"),
            Err(OnionError::KeySize { expected: 344, actual: 684 })
        ));
    }

    #[test]
    fn test_undersized_relay_key_fails_build() {
        let mut hops = circuit().hops().to_vec();
        hops[1].public_key = key_of_bits(512);
        let circuit = Circuit::new(hops).expect("circuit");
        let result = build_onion(
            &circuit,
            &PortLayout::default(),
            Address::from_port(3000),
            "hi",
        );
        assert!(matches!(result, Err(OnionError::KeySize { .. })));
    }

    #[test]
    fn test_large_relay_id_fits_address() {
        let kp = &keys()[0];
        let circuit = Circuit::new(vec![RelayRecord {
            id: u32::MAX,
            public_key: kp.public_key_b64().expect("export"),
        }])
        .expect("circuit");
        let layout = PortLayout {
            registry: 1,
            relay_base: u16::MAX,
            user_base: 2,
        };
        // u16::MAX + u32::MAX still fits in ten digits.
        let onion = build_onion(&circuit, &layout, Address::from_port(3000), "hi")
            .expect("ten digits suffice");
        assert_eq!(onion.entry.value(), u64::from(u16::MAX) + u64::from(u32::MAX));
    }
}
