//! # Region Registry
//!
//! The broadcast footprint is split into regions, each served by one
//! satellite beam. Every region reports that it put an order on the air
//! (a tx confirmation); regions with a ground receiver additionally report
//! that the order came back down (an rx confirmation).
//!
//! The catalog is seeded into storage once and is then immutable, with one
//! exception: an operator may flip `has_receiver` when a ground station is
//! commissioned or retired. Regions without a receiver only ever get
//! *presumed* rx confirmations.
//!
//! Reporters identify regions by `number`. The `id` (`number + 1`) is the
//! stable external identifier shown to operators.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// One broadcast zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Ordinal used by confirmation reporters.
    pub number: u8,
    /// Satellite serving the region.
    pub name: String,
    /// Coverage label.
    pub coverage: String,
    /// Whether a ground receiver can confirm reception.
    pub has_receiver: bool,
}

impl Region {
    fn new(number: u8, name: &str, coverage: &str, has_receiver: bool) -> Self {
        Self {
            number,
            name: name.to_string(),
            coverage: coverage.to_string(),
            has_receiver,
        }
    }

    /// External identifier.
    pub fn id(&self) -> u16 {
        u16::from(self.number) + 1
    }
}

/// The regions seeded at bootstrap.
pub fn catalog() -> Vec<Region> {
    vec![
        Region::new(0, "Galaxy 18", "North America", true),
        Region::new(1, "Eutelsat 113", "South America", true),
        Region::new(2, "Telstar 11N", "Africa", false),
        Region::new(3, "Telstar 11N", "Europe", false),
        Region::new(4, "Telstar 18V C", "Asia Pacific", true),
        Region::new(5, "Telstar 18V Ku", "Asia Pacific", true),
    ]
}

// ---------------------------------------------------------------------------
// RegionRegistry
// ---------------------------------------------------------------------------

/// In-memory view of the seeded catalog.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    regions: BTreeMap<u8, Region>,
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new(catalog())
    }
}

impl RegionRegistry {
    pub fn new(regions: impl IntoIterator<Item = Region>) -> Self {
        Self {
            regions: regions.into_iter().map(|r| (r.number, r)).collect(),
        }
    }

    /// Look up a region by number.
    pub fn get(&self, number: u8) -> QueueResult<&Region> {
        self.regions
            .get(&number)
            .ok_or(QueueError::RegionNotFound(number))
    }

    /// Validate every number before returning any of them.
    pub fn resolve(&self, numbers: &[u8]) -> QueueResult<BTreeSet<u8>> {
        numbers
            .iter()
            .map(|&n| self.get(n).map(|r| r.number))
            .collect()
    }

    /// Regions whose reception can only be presumed.
    pub fn receiverless(&self) -> BTreeSet<u8> {
        self.regions
            .values()
            .filter(|r| !r.has_receiver)
            .map(|r| r.number)
            .collect()
    }

    pub fn with_receiver(&self) -> BTreeSet<u8> {
        self.regions
            .values()
            .filter(|r| r.has_receiver)
            .map(|r| r.number)
            .collect()
    }

    pub fn numbers(&self) -> BTreeSet<u8> {
        self.regions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// QuorumPolicy
// ---------------------------------------------------------------------------

/// Which regions must confirm before an order counts as received.
///
/// The sets are plain data. They are fixed when the queue is built, so an
/// operator flipping `has_receiver` later does not retroactively change the
/// quorum of orders already in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumPolicy {
    pub required_tx: BTreeSet<u8>,
    pub required_rx: BTreeSet<u8>,
}

impl QuorumPolicy {
    /// Every region must transmit; every region with a receiver must receive.
    pub fn from_registry(registry: &RegionRegistry) -> Self {
        Self {
            required_tx: registry.numbers(),
            required_rx: registry.with_receiver(),
        }
    }
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self::from_registry(&RegionRegistry::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_layout() {
        let regions = catalog();
        assert_eq!(regions.len(), 6);
        assert_eq!(regions[0].id(), 1);
        assert_eq!(regions[5].id(), 6);
        assert_eq!(regions[2].coverage, "Africa");
        assert_eq!(regions[3].coverage, "Europe");
    }

    #[test]
    fn test_receiverless_regions() {
        let registry = RegionRegistry::default();
        assert_eq!(registry.receiverless(), BTreeSet::from([2, 3]));
        assert_eq!(registry.with_receiver(), BTreeSet::from([0, 1, 4, 5]));
    }

    #[test]
    fn test_unknown_region() {
        let registry = RegionRegistry::default();
        assert!(matches!(registry.get(6), Err(QueueError::RegionNotFound(6))));
    }

    #[test]
    fn test_resolve_validates_all_first() {
        let registry = RegionRegistry::default();
        assert!(registry.resolve(&[0, 1, 9]).is_err());
        assert_eq!(registry.resolve(&[1, 0, 1]).unwrap(), BTreeSet::from([0, 1]));
    }

    #[test]
    fn test_default_quorum() {
        let quorum = QuorumPolicy::default();
        assert_eq!(quorum.required_tx.len(), 6);
        assert_eq!(quorum.required_rx, BTreeSet::from([0, 1, 4, 5]));
    }
}
