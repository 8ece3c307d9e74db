//! In-memory, append-only relay directory.
//!
//! Relays register `(id, public key)` at startup; senders take snapshots to
//! build circuits. Records are never updated or removed, and a relay that
//! registers twice simply appears twice.

use std::collections::HashSet;

use shallot_types::network::RelayRecord;
use shallot_types::NodeId;
use tokio::sync::RwLock;
use tracing::debug;

/// Registry mapping relay ids to exported public keys.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    records: RwLock<Vec<RelayRecord>>,
}

impl NodeDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Duplicate ids are accepted.
    pub async fn register(&self, id: NodeId, public_key: String) {
        let mut records = self.records.write().await;
        records.push(RelayRecord { id, public_key });
        debug!(node_id = id, total = records.len(), "Relay registered");
    }

    /// Snapshot of every record, in insertion order.
    pub async fn list_all(&self) -> Vec<RelayRecord> {
        self.records.read().await.clone()
    }

    /// Number of records, duplicates included.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether nothing has registered yet.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Number of distinct relay ids.
    pub async fn distinct_ids(&self) -> usize {
        self.records
            .read()
            .await
            .iter()
            .map(|r| r.id)
            .collect::<HashSet<_>>()
            .len()
    }
}
