//! # shallot-onion
//!
//! The onion construction and deconstruction protocol.
//!
//! - [`directory`] - Append-only registry of relay public keys
//! - [`circuit`] - Uniform random selection of distinct relays
//! - [`onion`] - Layered encryption at the sender
//! - [`relay`] - Per-hop decrypt-and-forward
//! - [`observe`] - Injectable sinks for last-seen diagnostics
//! - [`forward`] - The single-attempt transport contract relays forward through
//!
//! ## Layer Format
//!
//! | Segment | Width | Content |
//! |---|---|---|
//! | wrapped key | 344 chars | base64 RSA-OAEP ciphertext of the layer's AES key |
//! | body | variable | `base64(iv) ":" base64(aes_cbc(next_address ++ inner))` |
//!
//! `next_address` is always ten digits wide, see [`shallot_types::Address`].

pub mod circuit;
pub mod directory;
pub mod forward;
pub mod observe;
pub mod onion;
pub mod relay;

pub use shallot_types::CIRCUIT_HOPS;

use shallot_crypto::rsa_oaep;

/// Width of the wrapped-key segment at the front of every layer.
///
/// Derived from the RSA modulus size. Making the key size configurable would
/// require length-prefixed framing instead of this fixed offset.
pub const WRAPPED_KEY_B64_LEN: usize = rsa_oaep::CIPHERTEXT_B64_LEN;

/// Error types for onion routing operations.
#[derive(Debug, thiserror::Error)]
pub enum OnionError {
    /// Fewer distinct relays are registered than the circuit needs.
    #[error("insufficient nodes: need {need}, have {have}")]
    InsufficientNodes { need: usize, have: usize },

    /// The requested circuit is not usable (empty, repeated relay).
    #[error("invalid circuit: {0}")]
    InvalidCircuit(String),

    /// The inbound blob does not have the layer structure.
    #[error("malformed onion: {0}")]
    MalformedOnion(String),

    /// A relay key has a modulus the fixed-width framing cannot carry.
    #[error("wrapped key is {actual} characters, framing requires {expected}")]
    KeySize { expected: usize, actual: usize },

    /// An address could not be encoded.
    #[error("address error: {0}")]
    Address(#[from] shallot_types::AddressError),

    /// Cryptographic error from shallot-crypto.
    #[error("crypto error: {0}")]
    Crypto(#[from] shallot_crypto::CryptoError),

    /// The single forwarding attempt failed.
    #[error(transparent)]
    Forwarding(#[from] forward::ForwardError),
}

/// Convenience result type for onion routing operations.
pub type Result<T> = std::result::Result<T, OnionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(WRAPPED_KEY_B64_LEN, 344);
        assert_eq!(CIRCUIT_HOPS, 3);
    }

    #[test]
    fn test_error_display() {
        let err = OnionError::InsufficientNodes { need: 3, have: 1 };
        assert!(err.to_string().contains("need 3"));
        assert!(err.to_string().contains("have 1"));
    }
}
