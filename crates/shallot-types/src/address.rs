//! Fixed-width routing addresses.
//!
//! Every decrypted onion layer starts with the address of the next hop,
//! rendered as exactly [`ADDRESS_WIDTH`] zero-padded decimal digits. The
//! width is what lets a relay split the address from the payload, so values
//! that would need more digits are rejected rather than widened.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{NodeId, UserId, ADDRESS_WIDTH, BASE_ONION_ROUTER_PORT, BASE_USER_PORT, REGISTRY_PORT};

/// Errors from encoding or parsing an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The value does not fit in ten decimal digits.
    #[error("address {0} does not fit in {ADDRESS_WIDTH} digits")]
    Overflow(u64),

    /// The encoded form is not exactly ten characters.
    #[error("encoded address must be {ADDRESS_WIDTH} characters, got {0}")]
    InvalidWidth(usize),

    /// The encoded form contains a non-digit.
    #[error("encoded address contains non-digit characters: {0:?}")]
    InvalidDigits(String),

    /// The address is valid but is not a usable network port.
    #[error("address {0} is not a valid port")]
    NotAPort(u64),
}

/// A routing address: a non-negative integer (a port) that fits in ten digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Address(u64);

impl Address {
    /// Largest encodable value.
    pub const MAX: u64 = 9_999_999_999;

    /// Create an address, rejecting values wider than ten digits.
    pub fn new(value: u64) -> Result<Self, AddressError> {
        if value > Self::MAX {
            return Err(AddressError::Overflow(value));
        }
        Ok(Self(value))
    }

    /// Any port fits.
    pub fn from_port(port: u16) -> Self {
        Self(u64::from(port))
    }

    /// The raw value.
    pub fn value(self) -> u64 {
        self.0
    }

    /// The address as a network port.
    pub fn port(self) -> Result<u16, AddressError> {
        u16::try_from(self.0).map_err(|_| AddressError::NotAPort(self.0))
    }

    /// Render as exactly ten zero-padded digits.
    pub fn encode(self) -> String {
        format!("{:0width$}", self.0, width = ADDRESS_WIDTH)
    }

    /// Parse exactly ten ASCII digits.
    pub fn parse(encoded: &str) -> Result<Self, AddressError> {
        if encoded.len() != ADDRESS_WIDTH {
            return Err(AddressError::InvalidWidth(encoded.len()));
        }
        if !encoded.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddressError::InvalidDigits(encoded.to_string()));
        }
        let value = encoded
            .parse::<u64>()
            .map_err(|_| AddressError::InvalidDigits(encoded.to_string()))?;
        Self::new(value)
    }

    /// Split a decrypted layer into its leading address and the remainder.
    pub fn split_prefix(plain: &str) -> Result<(Self, &str), AddressError> {
        // `get` yields None when byte 10 is not a char boundary.
        let head = plain
            .get(..ADDRESS_WIDTH)
            .ok_or(AddressError::InvalidWidth(plain.len().min(ADDRESS_WIDTH)))?;
        let addr = Self::parse(head)?;
        Ok((addr, &plain[ADDRESS_WIDTH..]))
    }
}

impl TryFrom<u64> for Address {
    type Error = AddressError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Address> for u64 {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Where registry, routers and users listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLayout {
    pub registry: u16,
    pub relay_base: u16,
    pub user_base: u16,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            registry: REGISTRY_PORT,
            relay_base: BASE_ONION_ROUTER_PORT,
            user_base: BASE_USER_PORT,
        }
    }
}

impl PortLayout {
    /// Address of the registry.
    pub fn registry_address(&self) -> Address {
        Address::from_port(self.registry)
    }

    /// Address of onion router `id`.
    pub fn relay_address(&self, id: NodeId) -> Result<Address, AddressError> {
        Address::new(u64::from(self.relay_base) + u64::from(id))
    }

    /// Address of user `id`.
    pub fn user_address(&self, id: UserId) -> Result<Address, AddressError> {
        Address::new(u64::from(self.user_base) + u64::from(id))
    }
}
