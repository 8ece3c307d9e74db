//! # shallot-types
//!
//! Shared domain types used across the shallot workspace.

pub mod address;
pub mod diagnostics;
pub mod network;

pub use address::{Address, AddressError, PortLayout};

/// Relay identifier as registered in the directory.
pub type NodeId = u32;

/// User agent identifier.
pub type UserId = u32;

/// Width of an encoded [`Address`] in characters.
pub const ADDRESS_WIDTH: usize = 10;

/// Number of hops in a circuit.
pub const CIRCUIT_HOPS: usize = 3;

/// Default registry port.
pub const REGISTRY_PORT: u16 = 8080;

/// Default base port for onion routers (router `n` listens on base + n).
pub const BASE_ONION_ROUTER_PORT: u16 = 4000;

/// Default base port for users (user `n` listens on base + n).
pub const BASE_USER_PORT: u16 = 3000;
