// Cluster state shared between the aligner core and the linked-read driver.
//
// The driver batches read pairs belonging to one molecule and serializes
// their mutating calls; scoring passes only read. The stripes use relaxed
// atomics so concurrent read-only scoring across aligner instances is sound,
// and stale reads during scoring are tolerated (flips resolve on the next
// correction pass).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::genome::GenomeLocation;

/// Cluster membership of a candidate placement.
///
/// The wire encoding keeps the historical small negative sentinels so results
/// can round-trip through formats that store a single integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterTag {
    /// Not associated with any cluster.
    Unlinked,
    /// The placement that seeded a cluster.
    Anchor,
    /// A placement pulled into a cluster by proximity alone.
    Magnet,
    /// Member of the cluster with this index.
    Cluster(u32),
}

const UNLINKED_WIRE: i32 = -1;
const ANCHOR_WIRE: i32 = -2;
const MAGNET_WIRE: i32 = -3;

impl ClusterTag {
    /// True for tags that participate in cluster score compensation.
    #[inline]
    pub fn is_cluster(self) -> bool {
        matches!(self, ClusterTag::Cluster(_))
    }

    pub fn to_wire(self) -> i32 {
        match self {
            ClusterTag::Unlinked => UNLINKED_WIRE,
            ClusterTag::Anchor => ANCHOR_WIRE,
            ClusterTag::Magnet => MAGNET_WIRE,
            ClusterTag::Cluster(idx) => idx as i32,
        }
    }

    pub fn from_wire(raw: i32) -> ClusterTag {
        match raw {
            UNLINKED_WIRE => ClusterTag::Unlinked,
            ANCHOR_WIRE => ClusterTag::Anchor,
            MAGNET_WIRE => ClusterTag::Magnet,
            idx if idx >= 0 => ClusterTag::Cluster(idx as u32),
            other => {
                log::warn!("unknown cluster tag {} on the wire; treating as unlinked", other);
                ClusterTag::Unlinked
            }
        }
    }
}

/// Per-locus molecule counters and the toggle stripe marking the loci of the
/// currently interesting cluster set. One byte / one flag per genome locus;
/// the driver sizes the stripes to the genome.
pub struct ClusterCounters {
    counts: Vec<AtomicU8>,
    toggles: Vec<AtomicBool>,
}

impl ClusterCounters {
    pub fn new(genome_len: usize) -> ClusterCounters {
        let mut counts = Vec::with_capacity(genome_len);
        counts.resize_with(genome_len, AtomicU8::default);
        let mut toggles = Vec::with_capacity(genome_len);
        toggles.resize_with(genome_len, AtomicBool::default);
        ClusterCounters { counts, toggles }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Molecule count at `location`; out-of-range reads as zero.
    #[inline]
    pub fn count(&self, location: GenomeLocation) -> u8 {
        match self.counts.get(location as usize) {
            Some(c) => c.load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// Saturating bump of the molecule count at `location`. Callers must hold
    /// exclusive writer access for the region (the driver's contract).
    pub fn increment(&self, location: GenomeLocation) {
        if let Some(c) = self.counts.get(location as usize) {
            let current = c.load(Ordering::Relaxed);
            if current < u8::MAX {
                c.store(current + 1, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn is_toggled(&self, location: GenomeLocation) -> bool {
        match self.toggles.get(location as usize) {
            Some(t) => t.load(Ordering::Relaxed),
            None => false,
        }
    }

    pub fn set_toggle(&self, location: GenomeLocation, on: bool) {
        if let Some(t) = self.toggles.get(location as usize) {
            t.store(on, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for tag in [
            ClusterTag::Unlinked,
            ClusterTag::Anchor,
            ClusterTag::Magnet,
            ClusterTag::Cluster(0),
            ClusterTag::Cluster(41),
        ] {
            assert_eq!(ClusterTag::from_wire(tag.to_wire()), tag);
        }
        assert_eq!(ClusterTag::Unlinked.to_wire(), -1);
        assert_eq!(ClusterTag::Anchor.to_wire(), -2);
        assert_eq!(ClusterTag::Magnet.to_wire(), -3);
    }

    #[test]
    fn only_cluster_tags_compensate() {
        assert!(ClusterTag::Cluster(3).is_cluster());
        assert!(!ClusterTag::Unlinked.is_cluster());
        assert!(!ClusterTag::Anchor.is_cluster());
        assert!(!ClusterTag::Magnet.is_cluster());
    }

    #[test]
    fn counters_saturate_and_clamp_range() {
        let counters = ClusterCounters::new(10);
        for _ in 0..300 {
            counters.increment(4);
        }
        assert_eq!(counters.count(4), u8::MAX);
        assert_eq!(counters.count(9999), 0);
        counters.increment(9999); // out of range: ignored
        counters.set_toggle(4, true);
        assert!(counters.is_toggled(4));
        assert!(!counters.is_toggled(5));
    }
}
