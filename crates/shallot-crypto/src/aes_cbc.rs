//! AES-256-CBC layer encryption.
//!
//! Every onion layer body is encrypted under its own [`SymmetricKey`], and every
//! encryption draws a fresh random IV. The serialized form is
//! `base64(iv) ":" base64(ciphertext)`.
//!
//! CBC carries no integrity check. A corrupted ciphertext may fail on padding,
//! but it may equally decrypt to garbage; callers must not treat a successful
//! decrypt as proof the input was intact.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding::{from_base64, to_base64};
use crate::{CryptoError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Key size (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// IV size (one AES block).
pub const IV_SIZE: usize = 16;

/// Separator between the IV and ciphertext segments.
pub const IV_SEPARATOR: char = ':';

/// An ephemeral AES-256 key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    /// Generate a key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Export the raw key bytes as base64.
    pub fn export(&self) -> String {
        to_base64(&self.bytes)
    }

    /// Import a base64 raw key.
    pub fn import(b64: &str) -> Result<Self> {
        let mut raw =
            from_base64(b64).map_err(|e| CryptoError::KeyFormat(format!("base64: {e}")))?;
        if raw.len() != KEY_SIZE {
            let actual = raw.len();
            raw.zeroize();
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual,
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self { bytes })
    }
}

/// Encrypt a UTF-8 string under `key` with a fresh IV.
pub fn encrypt(key: &SymmetricKey, plaintext: &str) -> String {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.bytes.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    format!("{}{IV_SEPARATOR}{}", to_base64(&iv), to_base64(&ciphertext))
}

/// Decrypt an `iv:ciphertext` string with a base64 key.
///
/// Splits on the first separator only.
pub fn decrypt(key_b64: &str, ciphertext_with_iv: &str) -> Result<String> {
    let key = SymmetricKey::import(key_b64).map_err(|e| CryptoError::Decryption(e.to_string()))?;

    let (iv_b64, ct_b64) = ciphertext_with_iv
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| CryptoError::Decryption("missing IV separator".to_string()))?;

    let iv_vec =
        from_base64(iv_b64).map_err(|e| CryptoError::Decryption(format!("IV base64: {e}")))?;
    let iv: [u8; IV_SIZE] = iv_vec.as_slice().try_into().map_err(|_| {
        CryptoError::Decryption(format!("IV must be {IV_SIZE} bytes, got {}", iv_vec.len()))
    })?;
    let ciphertext = from_base64(ct_b64)
        .map_err(|e| CryptoError::Decryption(format!("ciphertext base64: {e}")))?;

    let plain = Aes256CbcDec::new(&key.bytes.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::Decryption("bad padding".to_string()))?;

    String::from_utf8(plain)
        .map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".to_string()))
}
