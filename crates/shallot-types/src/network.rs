//! Directory records and wire bodies.
//!
//! Field names follow the JSON shapes the overlay has always exchanged
//! (`nodeId`, `pubKey`, `destinationUserId`), hence the camelCase renames.

use serde::{Deserialize, Serialize};

use crate::{NodeId, UserId};

/// A relay as registered in the directory.
///
/// The directory never deduplicates: the same `id` may appear more than once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    #[serde(rename = "nodeId")]
    pub id: NodeId,
    /// Base64 SPKI DER RSA public key.
    #[serde(rename = "pubKey")]
    pub public_key: String,
}

/// Body of a directory write.
pub type RegisterNodeBody = RelayRecord;

/// Body of a directory read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistryBody {
    pub nodes: Vec<RelayRecord>,
}

/// An inbound onion layer, or plaintext at the final recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

/// A request asking a user agent to send a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub message: String,
    pub destination_user_id: UserId,
}
