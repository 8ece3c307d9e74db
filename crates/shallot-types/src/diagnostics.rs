//! Last-seen diagnostics exposed by routers and users.

use serde::{Deserialize, Serialize};

use crate::{Address, NodeId};

/// What an onion router most recently saw.
///
/// All three fields describe the same inbound message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayDiagnostics {
    pub last_received_encrypted_message: Option<String>,
    pub last_received_decrypted_message: Option<String>,
    pub last_message_destination: Option<Address>,
}

/// What a user agent most recently sent and received.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDiagnostics {
    pub last_received_message: Option<String>,
    pub last_sent_message: Option<String>,
    /// Relay ids of the last circuit, entry first.
    pub last_circuit: Vec<NodeId>,
}
