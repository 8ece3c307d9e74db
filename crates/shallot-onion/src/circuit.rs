//! Circuit selection.
//!
//! A circuit is an ordered list of relays with pairwise-distinct ids, in send
//! order: `[entry, ..., exit]`. One circuit is drawn per message and dropped
//! after the onion is sent.
//!
//! ## Duplicate Registrations
//!
//! The directory may hold several records for one id. Selection collapses
//! them first, keeping the most recent record, so a relay that re-registered
//! is reached under its newest key. Cardinality is checked on distinct ids
//! before drawing, so selection never spins on a directory that is too small.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;
use shallot_types::network::RelayRecord;
use shallot_types::NodeId;
use tracing::debug;

use crate::{OnionError, Result};

/// An ordered path of distinct relays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Circuit {
    hops: Vec<RelayRecord>,
}

impl Circuit {
    /// Build a circuit from hops in send order.
    pub fn new(hops: Vec<RelayRecord>) -> Result<Self> {
        if hops.is_empty() {
            return Err(OnionError::InvalidCircuit(
                "circuit has no hops".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(hops.len());
        if let Some(dup) = hops.iter().find(|h| !seen.insert(h.id)) {
            return Err(OnionError::InvalidCircuit(format!(
                "relay {} appears more than once",
                dup.id
            )));
        }
        Ok(Self { hops })
    }

    /// Hops in send order.
    pub fn hops(&self) -> &[RelayRecord] {
        &self.hops
    }

    /// The first relay, which receives the onion.
    pub fn entry(&self) -> &RelayRecord {
        &self.hops[0]
    }

    /// The last relay, which delivers plaintext.
    pub fn exit(&self) -> &RelayRecord {
        &self.hops[self.hops.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Relay ids in send order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.hops.iter().map(|h| h.id).collect()
    }

    pub fn into_hops(self) -> Vec<RelayRecord> {
        self.hops
    }
}

/// Draw `length` distinct relays uniformly at random from `records`.
pub fn select_circuit(records: &[RelayRecord], length: usize) -> Result<Circuit> {
    select_circuit_with_rng(records, length, &mut rand::thread_rng())
}

/// [`select_circuit`] with a caller-supplied RNG.
pub fn select_circuit_with_rng<R: Rng + ?Sized>(
    records: &[RelayRecord],
    length: usize,
    rng: &mut R,
) -> Result<Circuit> {
    if length == 0 {
        return Err(OnionError::InvalidCircuit(
            "circuit length must be at least 1".to_string(),
        ));
    }

    let mut candidates = latest_per_id(records);
    if candidates.len() < length {
        return Err(OnionError::InsufficientNodes {
            need: length,
            have: candidates.len(),
        });
    }

    let (chosen, _) = candidates.partial_shuffle(rng, length);
    let hops = chosen.to_vec();

    debug!(
        hops = ?hops.iter().map(|h| h.id).collect::<Vec<_>>(),
        available = records.len(),
        "Selected circuit"
    );

    Circuit::new(hops)
}

/// One record per id, the last registration winning, in first-seen order.
fn latest_per_id(records: &[RelayRecord]) -> Vec<RelayRecord> {
    let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<RelayRecord> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(&record.id) {
            Some(&i) => out[i] = record.clone(),
            None => {
                index.insert(record.id, out.len());
                out.push(record.clone());
            }
        }
    }
    out
}
