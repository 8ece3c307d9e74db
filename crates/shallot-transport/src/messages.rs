//! The request/response envelope every service speaks.
//!
//! One [`Request`] travels per stream and is answered by one [`Response`].
//! Both are JSON; the QUIC layer adds a 4-byte little-endian length prefix.
//!
//! ```json
//! {"type":"Message","body":{"message":"..."}}
//! {"type":"Ok"}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shallot_types::diagnostics::{RelayDiagnostics, UserDiagnostics};
use shallot_types::network::{MessageBody, NodeRegistryBody, RegisterNodeBody, SendMessageBody};

use crate::{Result, TransportError};

/// Largest accepted frame. Onions grow by roughly a third per layer, so this
/// leaves room for multi-megabyte messages over three hops.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A call to a registry, router or user service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Request {
    /// Liveness probe.
    Status,
    /// Add a relay to the directory.
    RegisterNode(RegisterNodeBody),
    /// Read the whole directory.
    GetNodeRegistry,
    /// An onion layer for a router, or plaintext for a user.
    Message(MessageBody),
    /// Ask a user agent to send a message through a fresh circuit.
    SendMessage(SendMessageBody),
    /// Read the service's last-seen diagnostics.
    GetDiagnostics,
}

/// The answer to a [`Request`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Response {
    Live,
    Ok,
    Registry(NodeRegistryBody),
    Diagnostics(Diagnostics),
    Error { message: String },
}

/// Diagnostics of either kind of service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Diagnostics {
    Relay(RelayDiagnostics),
    User(UserDiagnostics),
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status => "Status",
            Self::RegisterNode(_) => "RegisterNode",
            Self::GetNodeRegistry => "GetNodeRegistry",
            Self::Message(_) => "Message",
            Self::SendMessage(_) => "SendMessage",
            Self::GetDiagnostics => "GetDiagnostics",
        }
    }
}

impl Response {
    /// Build an error response from anything displayable.
    pub fn error(err: impl std::fmt::Display) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }

    /// Answer for a request kind the service does not serve.
    pub fn unsupported(request: &Request) -> Self {
        Self::error(format!("{} is not supported here", request.kind()))
    }

    /// Require [`Response::Ok`].
    pub fn expect_ok(self) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            other => Err(other.unexpected("Ok")),
        }
    }

    /// Require [`Response::Registry`].
    pub fn expect_registry(self) -> Result<NodeRegistryBody> {
        match self {
            Self::Registry(body) => Ok(body),
            other => Err(other.unexpected("Registry")),
        }
    }

    /// Require [`Response::Diagnostics`].
    pub fn expect_diagnostics(self) -> Result<Diagnostics> {
        match self {
            Self::Diagnostics(d) => Ok(d),
            other => Err(other.unexpected("Diagnostics")),
        }
    }

    fn unexpected(self, wanted: &str) -> TransportError {
        match self {
            Self::Error { message } => TransportError::Rejected(message),
            other => TransportError::Deserialization(format!(
                "expected {wanted} response, got {other:?}"
            )),
        }
    }
}

/// Serialize a value to its JSON frame body.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| TransportError::Serialization(e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(TransportError::InvalidFrame(format!(
            "frame of {} bytes exceeds maximum {MAX_FRAME_SIZE}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Deserialize a JSON frame body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::Deserialization(e.to_string()))
}
