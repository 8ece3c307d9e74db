//! # shallot-daemon
//!
//! The overlay's services and the launcher that wires them together.
//!
//! - [`registry`] - Directory service: relays register, users read
//! - [`router`] - Onion router service: peel one layer, forward once
//! - [`user`] - User agent: build onions, receive plaintext
//! - [`network`] - Start a registry, N routers and M users on one fabric
//! - [`events`] - Daemon-wide event bus
//! - [`config`] - TOML configuration
//!
//! Services are written against [`shallot_transport::Fabric`], so the same
//! network runs over QUIC in the binary and in memory in tests.

pub mod config;
pub mod events;
pub mod network;
pub mod registry;
pub mod router;
pub mod user;

/// Error types for service operations.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Circuit selection, onion construction or peeling failed.
    #[error("onion error: {0}")]
    Onion(#[from] shallot_onion::OnionError),

    /// A request could not be sent or was rejected.
    #[error("transport error: {0}")]
    Transport(#[from] shallot_transport::TransportError),

    /// Key generation or export failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] shallot_crypto::CryptoError),

    /// A service id does not map to an address.
    #[error("address error: {0}")]
    Address(#[from] shallot_types::AddressError),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Convenience result type for service operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
