//! Standard (padded) base64 helpers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Encode bytes as standard padded base64.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard padded base64.
pub fn from_base64(s: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(s)
}

/// Length in characters of the padded base64 encoding of `n` bytes.
pub const fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}
