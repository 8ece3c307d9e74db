//! RSA-OAEP (SHA-256) key wrapping.
//!
//! Each relay holds one 2048-bit key pair for its process lifetime. Senders
//! use the relay's exported public key to wrap a fresh per-hop symmetric key.
//!
//! Public keys are exported as SPKI DER, private keys as PKCS#8 DER, both
//! base64-encoded. With a 2048-bit modulus every ciphertext is exactly
//! [`CIPHERTEXT_LEN`] bytes, which the onion framing relies on.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::encoding::{base64_len, from_base64, to_base64};
use crate::{CryptoError, Result};

/// Modulus size in bits. The public exponent is the `rsa` crate default, 65537.
pub const RSA_MODULUS_BITS: usize = 2048;

/// Ciphertext size in bytes (modulus size).
pub const CIPHERTEXT_LEN: usize = RSA_MODULUS_BITS / 8;

/// Ciphertext size in base64 characters (344 for a 2048-bit modulus).
pub const CIPHERTEXT_B64_LEN: usize = base64_len(CIPHERTEXT_LEN);

/// SHA-256 output size.
const HASH_LEN: usize = 32;

/// Largest plaintext OAEP/SHA-256 can carry under this modulus (190 bytes).
pub const OAEP_MAX_PLAINTEXT: usize = CIPHERTEXT_LEN - 2 * HASH_LEN - 2;

/// A relay's RSA key pair.
#[derive(Clone)]
pub struct KeyPair {
    pub public_key: RsaPublicKey,
    pub private_key: RsaPrivateKey,
}

impl KeyPair {
    /// Export the public half as base64 SPKI DER.
    pub fn public_key_b64(&self) -> Result<String> {
        export_public_key(&self.public_key)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("modulus_bits", &(self.public_key.size() * 8))
            .finish_non_exhaustive()
    }
}

/// Generate a fresh 2048-bit key pair.
pub fn generate_key_pair() -> Result<KeyPair> {
    generate_key_pair_with_bits(RSA_MODULUS_BITS)
}

/// Generate a key pair with a non-default modulus. Onion layers only accept
/// [`RSA_MODULUS_BITS`]; other sizes exist for interoperability checks.
pub fn generate_key_pair_with_bits(bits: usize) -> Result<KeyPair> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| CryptoError::KeyFormat(format!("key generation failed: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok(KeyPair {
        public_key,
        private_key,
    })
}

/// Modulus size of `key` in bytes, which is also its ciphertext size.
pub fn modulus_len(key: &RsaPublicKey) -> usize {
    key.size()
}

/// Export a public key as base64 SPKI DER.
pub fn export_public_key(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
    Ok(to_base64(der.as_bytes()))
}

/// Export a private key as base64 PKCS#8 DER.
///
/// Absence in, absence out: `None` is not an error.
pub fn export_private_key(key: Option<&RsaPrivateKey>) -> Result<Option<String>> {
    let Some(key) = key else {
        return Ok(None);
    };
    let der = key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::KeyFormat(e.to_string()))?;
    Ok(Some(to_base64(der.as_bytes())))
}

/// Import a base64 SPKI DER public key.
pub fn import_public_key(b64: &str) -> Result<RsaPublicKey> {
    let der = from_base64(b64).map_err(|e| CryptoError::KeyFormat(format!("base64: {e}")))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::KeyFormat(e.to_string()))
}

/// Import a base64 PKCS#8 DER private key.
pub fn import_private_key(b64: &str) -> Result<RsaPrivateKey> {
    let der = from_base64(b64).map_err(|e| CryptoError::KeyFormat(format!("base64: {e}")))?;
    RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| CryptoError::KeyFormat(e.to_string()))
}

/// Encrypt a base64 payload under a base64 public key.
///
/// The payload is decoded first; it is the raw bytes that are encrypted.
/// Returns the base64 ciphertext, always [`CIPHERTEXT_B64_LEN`] characters
/// for a 2048-bit key.
pub fn encrypt(plain_b64: &str, public_key_b64: &str) -> Result<String> {
    let public_key = import_public_key(public_key_b64)?;
    encrypt_with_key(plain_b64, &public_key)
}

/// Encrypt a base64 payload under an already imported public key.
///
/// A modulus too small to hold an OAEP/SHA-256 block is `KeyFormat`.
pub fn encrypt_with_key(plain_b64: &str, public_key: &RsaPublicKey) -> Result<String> {
    let plain = from_base64(plain_b64)
        .map_err(|e| CryptoError::Encryption(format!("payload is not base64: {e}")))?;

    let max = public_key
        .size()
        .checked_sub(2 * HASH_LEN + 2)
        .ok_or_else(|| {
            CryptoError::KeyFormat(format!(
                "{}-bit modulus is too small for OAEP with SHA-256",
                public_key.size() * 8
            ))
        })?;
    if plain.len() > max {
        return Err(CryptoError::Encryption(format!(
            "payload of {} bytes exceeds OAEP maximum of {max}",
            plain.len()
        )));
    }

    let cipher = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &plain)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(to_base64(&cipher))
}

/// Decrypt a base64 ciphertext, returning the plaintext as base64.
///
/// Ciphertexts come from untrusted peers, so the private-key operation is
/// blinded.
pub fn decrypt(cipher_b64: &str, private_key: &RsaPrivateKey) -> Result<String> {
    let cipher = from_base64(cipher_b64)
        .map_err(|e| CryptoError::Decryption(format!("ciphertext is not base64: {e}")))?;
    let plain = private_key
        .decrypt_blinded(&mut OsRng, Oaep::new::<Sha256>(), &cipher)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    Ok(to_base64(&plain))
}
