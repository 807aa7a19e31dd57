// Scoring candidates, mate candidates and merge anchors, pooled per aligner.
//
// All three pools are bump allocators: align resets them to empty and reuses
// the same entries call after call, so small alignments stay cache-resident.
// Entries refer to each other by arena index, never by pointer.

use crate::cluster::ClusterTag;
use crate::errors::AlignError;
use crate::genome::{locations_within, GenomeLocation, NUM_SET_PAIRS};

/// Cached outcome of a Landau-Vishkin call. `OverLimit` remembers the limit
/// it was computed under so a later pass with a higher limit knows to
/// rescore; a `Scored` entry is exact and reusable under any limit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum CachedScore {
    #[default]
    Unscored,
    OverLimit {
        limit: u32,
    },
    Scored {
        score: u32,
        match_probability: f64,
        location_offset: i32,
    },
}

/// More-hits-side placement. Kept in strictly descending genome order per set
/// pair; adjacent entries are within the spacing window of the fewer-hits
/// loci that produced them, so mate enumeration is a short linear walk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScoringMateCandidate {
    pub location: GenomeLocation,
    pub seed_offset: u32,
    pub best_possible_score: u32,
    pub score: CachedScore,
}

impl ScoringMateCandidate {
    pub fn new(
        location: GenomeLocation,
        seed_offset: u32,
        best_possible_score: u32,
    ) -> ScoringMateCandidate {
        ScoringMateCandidate {
            location,
            seed_offset,
            best_possible_score,
            score: CachedScore::Unscored,
        }
    }
}

/// Fewer-hits-side placement, linked into the bucket list for its
/// best-possible pair score.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScoringCandidate {
    pub location: GenomeLocation,
    pub seed_offset: u32,
    pub which_set_pair: usize,
    /// Index of the lowest-location mate in this candidate's window; phase 3
    /// walks from here toward lower indices (higher locations).
    pub mate_index: u32,
    pub best_possible_score: u32,
    /// The mate-side share of best_possible_score, needed to derive the
    /// fewer-end score limit.
    pub mate_lower_bound: u32,
    pub cluster: ClusterTag,
    /// Anchor that claimed this candidate, if any.
    pub merge_anchor: Option<u32>,
    pub next_in_bucket: Option<u32>,
    pub fewer_end_score: CachedScore,
}

/// A fully scored pair placement, ready for merging and emission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PairPlacement {
    /// Indel-adjusted locations.
    pub fewer_location: GenomeLocation,
    pub more_location: GenomeLocation,
    pub fewer_score: u32,
    pub more_score: u32,
    pub pair_probability: f64,
    pub compensated_score: i32,
    pub which_set_pair: usize,
    pub cluster: ClusterTag,
}

/// Aggregator for near-duplicate placements. The primary locations are fixed
/// at creation; later, better pairs replace the stored best but never move
/// the primary, so the 50-base window cannot slide along a repeat.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MergeAnchor {
    pub fewer_primary: GenomeLocation,
    pub more_primary: GenomeLocation,
    pub best: PairPlacement,
    pub candidate: u32,
    pub mate: u32,
}

impl MergeAnchor {
    pub fn new(
        fewer_primary: GenomeLocation,
        more_primary: GenomeLocation,
        best: PairPlacement,
        candidate: u32,
        mate: u32,
    ) -> MergeAnchor {
        MergeAnchor {
            fewer_primary,
            more_primary,
            best,
            candidate,
            mate,
        }
    }

    /// Whether a new placement falls inside this anchor's window.
    pub fn matches(
        &self,
        fewer_location: GenomeLocation,
        more_location: GenomeLocation,
        max_merge_distance: u64,
    ) -> bool {
        locations_within(self.fewer_primary, fewer_location, max_merge_distance)
            && locations_within(self.more_primary, more_location, max_merge_distance)
    }

    /// Offer a new placement. Returns true when it displaces the stored best
    /// (strictly greater probability); false means the new pair is merged
    /// away, though its probability still counts toward the pair total.
    pub fn consider(&mut self, placement: &PairPlacement) -> bool {
        if placement.pair_probability > self.best.pair_probability {
            self.best = *placement;
            true
        } else {
            false
        }
    }
}

pub(crate) struct CandidatePools {
    pub candidates: Vec<ScoringCandidate>,
    pub mates: [Vec<ScoringMateCandidate>; NUM_SET_PAIRS],
    pub anchors: Vec<MergeAnchor>,
    capacity: usize,
}

impl CandidatePools {
    pub fn new(capacity: usize) -> CandidatePools {
        CandidatePools {
            candidates: Vec::with_capacity(capacity),
            mates: [Vec::with_capacity(capacity), Vec::with_capacity(capacity)],
            anchors: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Bump-reset everything; entries from the previous align call become
    /// invalid here.
    pub fn reset(&mut self) {
        self.candidates.clear();
        for mates in &mut self.mates {
            mates.clear();
        }
        self.anchors.clear();
    }

    /// Drop all anchors and candidate back-pointers so a scoring pass can
    /// rebuild them from scratch.
    pub fn reset_anchors(&mut self) {
        self.anchors.clear();
        for candidate in &mut self.candidates {
            candidate.merge_anchor = None;
        }
    }

    pub fn push_candidate(&mut self, candidate: ScoringCandidate) -> Result<u32, AlignError> {
        if self.candidates.len() == self.capacity {
            return Err(AlignError::CandidatePoolExhausted {
                capacity: self.capacity,
            });
        }
        self.candidates.push(candidate);
        Ok((self.candidates.len() - 1) as u32)
    }

    pub fn push_mate(
        &mut self,
        which_set_pair: usize,
        mate: ScoringMateCandidate,
    ) -> Result<u32, AlignError> {
        let mates = &mut self.mates[which_set_pair];
        if mates.len() == self.capacity {
            return Err(AlignError::MateCandidatePoolExhausted {
                set_pair: which_set_pair,
                capacity: self.capacity,
            });
        }
        debug_assert!(mates.last().map_or(true, |m| m.location > mate.location));
        mates.push(mate);
        Ok((mates.len() - 1) as u32)
    }

    pub fn push_anchor(&mut self, anchor: MergeAnchor) -> Result<u32, AlignError> {
        if self.anchors.len() == self.capacity {
            return Err(AlignError::MergeAnchorPoolExhausted {
                capacity: self.capacity,
            });
        }
        self.anchors.push(anchor);
        Ok((self.anchors.len() - 1) as u32)
    }
}
