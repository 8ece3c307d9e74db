//! # shallot-crypto
//!
//! Cryptographic primitives for the shallot onion-routing overlay.
//!
//! The suite is fixed; there is no algorithm negotiation:
//!
//! - [`rsa_oaep`] - 2048-bit RSA-OAEP with SHA-256, used to wrap per-hop keys
//! - [`aes_cbc`] - AES-256-CBC with PKCS#7 padding, used for layer bodies
//! - [`encoding`] - base64 helpers shared by both
//!
//! Keys and ciphertexts cross crate boundaries as standard base64 strings,
//! since the onion itself is a plain string.

pub mod aes_cbc;
pub mod encoding;
pub mod rsa_oaep;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A serialized key could not be decoded or parsed.
    #[error("key format error: {0}")]
    KeyFormat(String),

    /// Encryption failed (e.g. plaintext too large for OAEP).
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (wrong key, corrupted ciphertext, bad padding).
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CryptoError::InvalidKeyLength {
            expected: 32,
            actual: 16,
        };
        assert_eq!(err.to_string(), "invalid key length: expected 32, got 16");

        let err = CryptoError::Decryption("bad padding".into());
        assert!(err.to_string().contains("bad padding"));
    }
}
