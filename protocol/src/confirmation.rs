//! # Confirmation Quorum
//!
//! Regions report back after an order goes on the air. A tx confirmation
//! says "we transmitted it", an rx confirmation says "our ground station
//! heard it". Delivery is proven once every required region has confirmed
//! both ways; receiver-less regions then get a *presumed* rx confirmation
//! so the record is complete.
//!
//! Confirmations are append-only facts. Reporting the same (order, region)
//! pair twice is harmless.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::region::QuorumPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationKind {
    Tx,
    Rx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub order_uuid: Uuid,
    /// Region number.
    pub region: u8,
    pub created_at: DateTime<Utc>,
    /// Synthesized rather than reported.
    pub presumed: bool,
}

impl Confirmation {
    pub fn reported(order_uuid: Uuid, region: u8, now: DateTime<Utc>) -> Self {
        Self {
            order_uuid,
            region,
            created_at: now,
            presumed: false,
        }
    }

    pub fn presumed(order_uuid: Uuid, region: u8, now: DateTime<Utc>) -> Self {
        Self {
            order_uuid,
            region,
            created_at: now,
            presumed: true,
        }
    }
}

impl QuorumPolicy {
    /// True once every required region confirmed in both directions.
    pub fn is_met(&self, tx: &BTreeSet<u8>, rx: &BTreeSet<u8>) -> bool {
        tx.is_superset(&self.required_tx) && rx.is_superset(&self.required_rx)
    }
}

/// Receiver-less regions still lacking an rx confirmation.
pub fn presumed_rx_needed(receiverless: &BTreeSet<u8>, rx: &BTreeSet<u8>) -> BTreeSet<u8> {
    receiverless.difference(rx).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_needs_all_tx() {
        let quorum = QuorumPolicy::default();
        let rx = BTreeSet::from([0, 1, 4, 5]);
        assert!(!quorum.is_met(&BTreeSet::from([0, 1, 2, 3, 4]), &rx));
        assert!(quorum.is_met(&BTreeSet::from([0, 1, 2, 3, 4, 5]), &rx));
    }

    #[test]
    fn test_quorum_three_of_four_rx() {
        let quorum = QuorumPolicy::default();
        let tx: BTreeSet<u8> = (0..6).collect();
        assert!(!quorum.is_met(&tx, &BTreeSet::from([0, 1, 4])));
        assert!(quorum.is_met(&tx, &BTreeSet::from([0, 1, 4, 5])));
    }

    #[test]
    fn test_presumed_only_for_missing() {
        let receiverless = BTreeSet::from([2, 3]);
        assert_eq!(
            presumed_rx_needed(&receiverless, &BTreeSet::from([0, 1, 4, 5])),
            BTreeSet::from([2, 3])
        );
        assert_eq!(
            presumed_rx_needed(&receiverless, &BTreeSet::from([0, 2])),
            BTreeSet::from([3])
        );
    }
}
