//! # shallot-transport
//!
//! Request/response plumbing between the overlay's services.
//!
//! - **Envelope** types and JSON framing via [`messages`]
//! - **Service traits** ([`RequestHandler`], [`RequestSender`], [`Fabric`]) via [`service`]
//! - **QUIC/TLS 1.3** endpoints via [`quic`]
//! - **In-process** routing for tests and single-process runs via [`memory`]
//!
//! ## Architecture
//!
//! ```text
//! RouterService / UserService / RegistryService  (shallot-daemon)
//!     |
//!     v
//! Request / Response (messages.rs)  -- JSON, one pair per stream
//!     |
//!     v
//! QuicEndpoint (quic.rs)            -- [len:4 LE][json] on a bidi stream
//!  or MemoryNetwork (memory.rs)     -- address table, no sockets
//! ```
//!
//! Every send is a single attempt. Nothing here retries.

pub mod memory;
pub mod messages;
pub mod quic;
pub mod service;

pub use service::{Fabric, RequestHandler, RequestSender, ServiceHandle};

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// JSON deserialization error, or a response of the wrong kind.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Length prefix out of range.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),

    /// The peer answered with an error response.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// Nothing is listening at the address.
    #[error("unreachable: {0}")]
    Unreachable(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
