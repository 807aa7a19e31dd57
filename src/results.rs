// Paired alignment results and mapping quality.

use crate::cluster::ClusterTag;
use crate::genome::{Direction, GenomeLocation, NUM_READS_PER_PAIR};

pub const MAX_MAPQ: i32 = 70;

/// Sentinel for "no pair found yet" when threading the best compensated
/// score through the phase-3 entry points.
pub const UNSET_SCORE: i32 = i32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentStatus {
    NotFound,
    SingleHit,
    MultipleHits,
}

/// One placement of a read pair. Arrays are indexed by read number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairedAlignmentResult {
    pub status: [AlignmentStatus; NUM_READS_PER_PAIR],
    pub location: [GenomeLocation; NUM_READS_PER_PAIR],
    pub direction: [Direction; NUM_READS_PER_PAIR],
    /// Per-end edit distance.
    pub score: [u32; NUM_READS_PER_PAIR],
    pub mapq: [i32; NUM_READS_PER_PAIR],
    /// Probability of this pair placement (both ends, penalties applied).
    pub probability: f64,
    /// Pair score after cluster compensation; may be negative.
    pub compensated_score: i32,
    pub cluster: ClusterTag,
    /// Set when the cluster-correction loop failed to converge.
    pub flagged_for_review: bool,
}

impl PairedAlignmentResult {
    pub fn unmapped() -> PairedAlignmentResult {
        PairedAlignmentResult {
            status: [AlignmentStatus::NotFound; NUM_READS_PER_PAIR],
            location: [0; NUM_READS_PER_PAIR],
            direction: [Direction::Forward, Direction::ReverseComplement],
            score: [0; NUM_READS_PER_PAIR],
            mapq: [0; NUM_READS_PER_PAIR],
            probability: 0.0,
            compensated_score: UNSET_SCORE,
            cluster: ClusterTag::Unlinked,
            flagged_for_review: false,
        }
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.status[0] != AlignmentStatus::NotFound && self.status[1] != AlignmentStatus::NotFound
    }
}

/// MAPQ from the probability mass of one placement against all observed
/// placements: -10 log10(1 - best/all), clamped to [0, MAX_MAPQ].
///
/// Each popular seed skipped in phase 1 hides an unknown number of competing
/// placements, so it costs one point.
pub fn compute_mapq(
    probability_of_best_pair: f64,
    probability_of_all_pairs: f64,
    popular_seeds_skipped: u32,
) -> i32 {
    let base = if probability_of_all_pairs <= probability_of_best_pair {
        MAX_MAPQ
    } else {
        let correctness = probability_of_best_pair / probability_of_all_pairs;
        let q = -10.0 * (1.0 - correctness).log10();
        if q.is_finite() {
            (q.round() as i32).clamp(0, MAX_MAPQ)
        } else {
            MAX_MAPQ
        }
    };
    (base - popular_seeds_skipped as i32).max(0)
}
