// The four-phase paired-end alignment core.
//
// Phase 1 chooses seeds and fills the per-(read, direction) hit sets.
// Phase 2 intersects the two set pairs: it walks the fewer-hits side of each
// downward through the genome and materializes every more-hits hit within the
// spacing window as a mate candidate. Phase 3 scores candidates in order of
// their best possible score, applies cluster compensation, and merges
// near-duplicates through anchors. Phase 4 turns the surviving anchors into
// a best result plus ranked secondaries with MAPQ.
//
// One aligner instance is strictly single-threaded and owns all its scratch;
// the external driver runs one instance per worker. The cluster counter
// stripes are the only shared state, and the driver serializes writes to
// them (align_phase_3_increment_cluster) per molecule.

use crate::candidates::{
    CachedScore, CandidatePools, MergeAnchor, PairPlacement, ScoringCandidate,
    ScoringMateCandidate,
};
use crate::cluster::{ClusterCounters, ClusterTag};
use crate::edit_distance::{EditDistanceScorer, ScoredAlignment};
use crate::errors::AlignError;
use crate::genome::{
    distance_between, locations_within, Direction, GenomeIndex, GenomeLocation, NUM_READS_PER_PAIR,
    NUM_SET_PAIRS,
};
use crate::hit_set::HashTableHitSet;
use crate::pair_opt::{PairOpt, MAX_MAX_SEEDS, MAX_MERGE_DISTANCE, MAX_SCORE_REVISIONS};
use crate::reads::{is_unambiguous_base, PreparedRead};
use crate::results::{compute_mapq, AlignmentStatus, PairedAlignmentResult, UNSET_SCORE};

/// Outcome of one single-step advance of a set pair in phase 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocusStep {
    /// The current fewer-hits locus has at least one mate in the spacing
    /// window; call `align_phase_2_add_candidate` to materialize it.
    MateInRange,
    /// No mate in range; the fewer-hits cursor moved down one locus.
    Advanced,
    /// The fewer-hits side of this set pair is exhausted.
    Exhausted,
}

/// Direction of `which_read` within a set pair: set pair 0 is
/// {read0 forward, read1 RC}, set pair 1 the mirror image.
#[inline]
fn direction_of(which_set_pair: usize, which_read: usize) -> Direction {
    if (which_read == 0) == (which_set_pair == 0) {
        Direction::Forward
    } else {
        Direction::ReverseComplement
    }
}

#[derive(Debug, Clone, Copy)]
struct SetPairCursor {
    fewer_loc: GenomeLocation,
    fewer_seed_offset: u32,
    fewer_done: bool,
    mate_loc: GenomeLocation,
    mate_seed_offset: u32,
    mate_done: bool,
}

impl Default for SetPairCursor {
    fn default() -> SetPairCursor {
        SetPairCursor {
            fewer_loc: 0,
            fewer_seed_offset: 0,
            fewer_done: true,
            mate_loc: GenomeLocation::MAX,
            mate_seed_offset: 0,
            mate_done: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ContigHitCount {
    epoch: i64,
    hits: i32,
}

/// Stats produced by one full scoring pass over the candidate buckets.
#[derive(Debug, Clone, Copy)]
struct PassStats {
    best_score: i32,
    best_anchor: Option<u32>,
    probability_of_all_pairs: f64,
}

pub struct PairAligner<'a, I: GenomeIndex> {
    index: &'a I,
    opt: PairOpt,
    seed_len: usize,
    forward_scorer: Box<dyn EditDistanceScorer>,
    reverse_scorer: Box<dyn EditDistanceScorer>,
    cluster: &'a ClusterCounters,

    reads: [PreparedRead; NUM_READS_PER_PAIR],
    seed_used: Vec<bool>,
    hit_sets: [[HashTableHitSet<'a>; 2]; NUM_READS_PER_PAIR],
    total_hits: [i64; NUM_READS_PER_PAIR],
    read_with_fewer_hits: usize,
    popular_seeds_skipped: [u32; NUM_READS_PER_PAIR],

    cursors: [SetPairCursor; NUM_SET_PAIRS],

    pools: CandidatePools,
    /// Head of the candidate list for each best-possible score.
    buckets: Vec<Option<u32>>,
    max_used_bucket: usize,

    probability_of_all_pairs: f64,
    n_locations_scored: i64,

    contig_counts: Vec<ContigHitCount>,
    contig_count_epoch: i64,
}

impl<'a, I: GenomeIndex> PairAligner<'a, I> {
    pub fn new(
        index: &'a I,
        opt: PairOpt,
        forward_scorer: Box<dyn EditDistanceScorer>,
        reverse_scorer: Box<dyn EditDistanceScorer>,
        cluster: &'a ClusterCounters,
    ) -> PairAligner<'a, I> {
        let seed_len = index.seed_len();
        let pool_capacity = opt.candidate_pool_size(MAX_MAX_SEEDS);
        let n_buckets = (opt.max_k + opt.extra_search_depth + 1) as usize;
        PairAligner {
            index,
            opt,
            seed_len,
            forward_scorer,
            reverse_scorer,
            cluster,
            reads: Default::default(),
            seed_used: Vec::new(),
            hit_sets: [
                [
                    HashTableHitSet::new(MAX_MAX_SEEDS, MAX_MERGE_DISTANCE),
                    HashTableHitSet::new(MAX_MAX_SEEDS, MAX_MERGE_DISTANCE),
                ],
                [
                    HashTableHitSet::new(MAX_MAX_SEEDS, MAX_MERGE_DISTANCE),
                    HashTableHitSet::new(MAX_MAX_SEEDS, MAX_MERGE_DISTANCE),
                ],
            ],
            total_hits: [0; NUM_READS_PER_PAIR],
            read_with_fewer_hits: 0,
            popular_seeds_skipped: [0; NUM_READS_PER_PAIR],
            cursors: [SetPairCursor::default(); NUM_SET_PAIRS],
            pools: CandidatePools::new(pool_capacity),
            buckets: vec![None; n_buckets],
            max_used_bucket: 0,
            probability_of_all_pairs: 0.0,
            n_locations_scored: 0,
            contig_counts: vec![ContigHitCount::default(); index.contig_count()],
            contig_count_epoch: 0,
        }
    }

    /// Landau-Vishkin invocations over the aligner's lifetime.
    pub fn locations_scored(&self) -> i64 {
        self.n_locations_scored
    }

    /// Seeds dropped by the popularity filter in the last align call, per
    /// read.
    pub fn popular_seeds_skipped(&self) -> [u32; NUM_READS_PER_PAIR] {
        self.popular_seeds_skipped
    }

    /// Bump-reset all per-call scratch. The per-contig table is reset in
    /// O(1) by bumping its epoch.
    fn reset(&mut self) {
        for read_sets in &mut self.hit_sets {
            for set in read_sets {
                set.init();
            }
        }
        self.total_hits = [0; NUM_READS_PER_PAIR];
        self.popular_seeds_skipped = [0; NUM_READS_PER_PAIR];
        self.cursors = [SetPairCursor::default(); NUM_SET_PAIRS];
        self.pools.reset();
        self.buckets.fill(None);
        self.max_used_bucket = 0;
        self.probability_of_all_pairs = 0.0;
        self.contig_count_epoch += 1;
    }

    // ------------------------------------------------------------------
    // Phase 1: seed selection and hash-table lookup
    // ------------------------------------------------------------------

    /// Populate the hit sets for both reads. Returns true when the pair is
    /// already done (one read produced no usable lookups) and should be
    /// reported unmapped.
    pub fn align_phase_1(&mut self, read0: &[u8], read1: &[u8]) -> bool {
        self.reset();
        self.reads[0].prepare(read0);
        self.reads[1].prepare(read1);

        let index = self.index;
        let seed_len = self.seed_len;
        let max_big_hits = self.opt.max_big_hits as usize;

        for which_read in 0..NUM_READS_PER_PAIR {
            let read_len = self.reads[which_read].len();
            if read_len < seed_len {
                log::debug!(
                    "read {} shorter than seed length ({} < {})",
                    which_read,
                    read_len,
                    seed_len
                );
                continue;
            }
            let max_seeds = self.opt.seeds_to_use(read_len, seed_len);
            self.seed_used.clear();
            self.seed_used.resize(read_len, false);
            let mut seeds_used = 0usize;

            let mut offset = 0usize;
            while offset + seed_len <= read_len && seeds_used < max_seeds {
                if self.seed_used[offset..offset + seed_len].iter().any(|&u| u) {
                    offset += 1;
                    continue;
                }
                let seed = &self.reads[which_read].bases(Direction::Forward)
                    [offset..offset + seed_len];
                if !seed.iter().copied().all(is_unambiguous_base) {
                    offset += 1;
                    continue;
                }
                let hits = index.lookup(seed);
                let forward_big = hits.forward.len() > max_big_hits;
                let rc_big = hits.reverse_complement.len() > max_big_hits;
                if forward_big && rc_big {
                    // Overly popular in both orientations; drop it but let it
                    // consume its slot so a pathological read terminates.
                    self.popular_seeds_skipped[which_read] += 1;
                } else {
                    // Chosen seeds never overlap, so every recorded lookup
                    // starts its own disjoint hit set.
                    if !forward_big {
                        self.hit_sets[which_read][Direction::Forward.index()].record_lookup(
                            offset as u32,
                            hits.forward,
                            true,
                        );
                    }
                    if !rc_big {
                        // A reverse-complement hit places the RC read start at
                        // hit - (readLen - seedLen - offset).
                        self.hit_sets[which_read][Direction::ReverseComplement.index()]
                            .record_lookup(
                                (read_len - seed_len - offset) as u32,
                                hits.reverse_complement,
                                true,
                            );
                    }
                }
                for used in &mut self.seed_used[offset..offset + seed_len] {
                    *used = true;
                }
                seeds_used += 1;
                offset += seed_len;
            }

            self.total_hits[which_read] = self.hit_sets[which_read][0].total_hits()
                + self.hit_sets[which_read][1].total_hits();
            log::debug!(
                "read {}: {} seeds used, {} popular skipped, {} total hits",
                which_read,
                seeds_used,
                self.popular_seeds_skipped[which_read],
                self.total_hits[which_read]
            );
        }

        self.read_with_fewer_hits = if self.total_hits[0] <= self.total_hits[1] {
            0
        } else {
            1
        };

        (0..NUM_READS_PER_PAIR).any(|r| {
            self.hit_sets[r][0].n_lookups() + self.hit_sets[r][1].n_lookups() == 0
        })
    }

    // ------------------------------------------------------------------
    // Phase 2: set-pair intersection and candidate construction
    // ------------------------------------------------------------------

    /// Load the initial locus cursors. Returns true when at least one set
    /// pair has hits on both sides, i.e. a common locus is possible.
    pub fn align_phase_2_init(&mut self) -> bool {
        let fewer = self.read_with_fewer_hits;
        let more = 1 - fewer;
        for sp in 0..NUM_SET_PAIRS {
            let fewer_dir = direction_of(sp, fewer).index();
            let more_dir = direction_of(sp, more).index();
            let more_alive = self.hit_sets[more][more_dir].n_lookups() > 0;
            let first = self.hit_sets[fewer][fewer_dir].get_first_hit();
            self.cursors[sp] = match first {
                Some((loc, seed_offset)) if more_alive => SetPairCursor {
                    fewer_loc: loc,
                    fewer_seed_offset: seed_offset,
                    fewer_done: false,
                    mate_loc: GenomeLocation::MAX,
                    mate_seed_offset: 0,
                    mate_done: false,
                },
                _ => SetPairCursor::default(),
            };
        }
        self.cursors.iter().any(|c| !c.fewer_done)
    }

    /// The next fewer-hits locus the intersection will process: the higher
    /// of the two set pairs' cursors. None when both are exhausted.
    pub fn align_phase_2_get_locus(&self) -> Option<GenomeLocation> {
        self.cursors
            .iter()
            .filter(|c| !c.fewer_done)
            .map(|c| c.fewer_loc)
            .max()
    }

    /// Set pair whose cursor the walk should process next.
    fn next_set_pair(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for sp in 0..NUM_SET_PAIRS {
            if self.cursors[sp].fewer_done {
                continue;
            }
            best = match best {
                Some(b) if self.cursors[b].fewer_loc >= self.cursors[sp].fewer_loc => Some(b),
                _ => Some(sp),
            };
        }
        best
    }

    fn advance_fewer(&mut self, which_set_pair: usize) {
        let fewer = self.read_with_fewer_hits;
        let dir = direction_of(which_set_pair, fewer).index();
        match self.hit_sets[fewer][dir].get_next_lower_hit() {
            Some((loc, seed_offset)) => {
                self.cursors[which_set_pair].fewer_loc = loc;
                self.cursors[which_set_pair].fewer_seed_offset = seed_offset;
            }
            None => self.cursors[which_set_pair].fewer_done = true,
        }
    }

    /// True when the current fewer locus of `which_set_pair` has at least one
    /// mate candidate (cursor-side or already materialized) inside the
    /// spacing window.
    fn mate_window_viable(&self, which_set_pair: usize) -> bool {
        let c = &self.cursors[which_set_pair];
        let max_spacing = self.opt.max_spacing as u64;
        if !c.mate_done && c.mate_loc.saturating_add(max_spacing) >= c.fewer_loc {
            return true;
        }
        // Even with the cursor below (or out of) the window, mates
        // materialized for earlier, higher loci can still sit inside it.
        self.pools.mates[which_set_pair]
            .last()
            .map_or(false, |m| locations_within(m.location, c.fewer_loc, max_spacing))
    }

    /// One step of the intersection walk for one set pair: bring the
    /// more-hits cursor down to the window of the current fewer locus, then
    /// either report a mate in range or advance to the next fewer locus.
    pub fn align_phase_2_move_locus(&mut self, which_set_pair: usize) -> LocusStep {
        if self.cursors[which_set_pair].fewer_done {
            return LocusStep::Exhausted;
        }
        let fewer_loc = self.cursors[which_set_pair].fewer_loc;
        let max_spacing = self.opt.max_spacing as u64;
        let more = 1 - self.read_with_fewer_hits;
        let more_dir = direction_of(which_set_pair, more).index();

        if !self.cursors[which_set_pair].mate_done
            && self.cursors[which_set_pair].mate_loc > fewer_loc.saturating_add(max_spacing)
        {
            match self.hit_sets[more][more_dir]
                .get_next_hit_less_than_or_equal_to(fewer_loc.saturating_add(max_spacing))
            {
                Some((loc, seed_offset)) => {
                    self.cursors[which_set_pair].mate_loc = loc;
                    self.cursors[which_set_pair].mate_seed_offset = seed_offset;
                }
                None => self.cursors[which_set_pair].mate_done = true,
            }
        }

        if self.mate_window_viable(which_set_pair) {
            LocusStep::MateInRange
        } else {
            self.advance_fewer(which_set_pair);
            if self.cursors[which_set_pair].fewer_done {
                LocusStep::Exhausted
            } else {
                LocusStep::Advanced
            }
        }
    }

    /// Materialize the mate window of the current fewer locus, allocate its
    /// scoring candidate tagged with `cluster`, and advance to the next
    /// fewer locus. Only valid after `align_phase_2_move_locus` returned
    /// `MateInRange`.
    pub fn align_phase_2_add_candidate(
        &mut self,
        which_set_pair: usize,
        cluster: ClusterTag,
    ) -> Result<(), AlignError> {
        let fewer_loc = self.cursors[which_set_pair].fewer_loc;
        let fewer_seed_offset = self.cursors[which_set_pair].fewer_seed_offset;
        let max_spacing = self.opt.max_spacing as u64;
        let more = 1 - self.read_with_fewer_hits;
        let more_dir = direction_of(which_set_pair, more).index();

        // Append every mate hit down to the bottom of this locus's window.
        // The array stays strictly descending because the cursor only moves
        // down.
        while !self.cursors[which_set_pair].mate_done
            && self.cursors[which_set_pair].mate_loc.saturating_add(max_spacing) >= fewer_loc
        {
            let bound = self.hit_sets[more][more_dir].compute_best_possible_score_for_current_hit();
            self.pools.push_mate(
                which_set_pair,
                ScoringMateCandidate::new(
                    self.cursors[which_set_pair].mate_loc,
                    self.cursors[which_set_pair].mate_seed_offset,
                    bound,
                ),
            )?;
            match self.hit_sets[more][more_dir].get_next_lower_hit() {
                Some((loc, seed_offset)) => {
                    self.cursors[which_set_pair].mate_loc = loc;
                    self.cursors[which_set_pair].mate_seed_offset = seed_offset;
                }
                None => self.cursors[which_set_pair].mate_done = true,
            }
        }

        // Walk the window (a suffix of the mate array) for its best lower
        // bound; the candidate starts its phase-3 mate walk at the lowest
        // in-window index.
        let (mate_index, mate_lower_bound, window_ok) = {
            let mates = &self.pools.mates[which_set_pair];
            match mates.last() {
                Some(last) if locations_within(last.location, fewer_loc, max_spacing) => {
                    let mut bound = u32::MAX;
                    let mut i = mates.len();
                    while i > 0 && locations_within(mates[i - 1].location, fewer_loc, max_spacing) {
                        bound = bound.min(mates[i - 1].best_possible_score);
                        i -= 1;
                    }
                    ((mates.len() - 1) as u32, bound, true)
                }
                _ => (0, 0, false),
            }
        };

        if window_ok {
            let fewer = self.read_with_fewer_hits;
            let fewer_dir = direction_of(which_set_pair, fewer).index();
            let fewer_bound =
                self.hit_sets[fewer][fewer_dir].compute_best_possible_score_for_current_hit();
            // An untargeted candidate landing on a toggled locus is pulled in
            // by proximity; it gets the magnet tag but no compensation.
            let cluster = if cluster == ClusterTag::Unlinked && self.cluster.is_toggled(fewer_loc)
            {
                ClusterTag::Magnet
            } else {
                cluster
            };
            let best_possible = fewer_bound + mate_lower_bound;
            if best_possible <= self.opt.max_k + self.opt.extra_search_depth {
                let bucket = best_possible as usize;
                let head = self.buckets[bucket];
                let ci = self.pools.push_candidate(ScoringCandidate {
                    location: fewer_loc,
                    seed_offset: fewer_seed_offset,
                    which_set_pair,
                    mate_index,
                    best_possible_score: best_possible,
                    mate_lower_bound,
                    cluster,
                    merge_anchor: None,
                    next_in_bucket: head,
                    fewer_end_score: CachedScore::Unscored,
                })?;
                self.buckets[bucket] = Some(ci);
                self.max_used_bucket = self.max_used_bucket.max(bucket);
            }
        }

        self.advance_fewer(which_set_pair);
        Ok(())
    }

    /// Advance both set pairs until their fewer-hits cursors drop below
    /// `target`, tagging every candidate created on the way with `cluster`.
    /// Returns false once both set pairs are exhausted.
    pub fn align_phase_2_to_target_loc(
        &mut self,
        target: GenomeLocation,
        cluster: ClusterTag,
    ) -> Result<bool, AlignError> {
        loop {
            let sp = match self.next_set_pair() {
                Some(sp) => sp,
                None => return Ok(false),
            };
            if self.cursors[sp].fewer_loc < target {
                return Ok(true);
            }
            match self.align_phase_2_move_locus(sp) {
                LocusStep::MateInRange => self.align_phase_2_add_candidate(sp, cluster)?,
                LocusStep::Advanced | LocusStep::Exhausted => {}
            }
        }
    }

    /// Run the whole intersection without cluster targeting.
    pub fn align_phase_2(&mut self) -> Result<(), AlignError> {
        self.align_phase_2_to_target_loc(0, ClusterTag::Unlinked)
            .map(|_| {
                log::debug!(
                    "phase 2: {} candidates, {}/{} mates",
                    self.pools.candidates.len(),
                    self.pools.mates[0].len(),
                    self.pools.mates[1].len()
                );
            })
    }

    // ------------------------------------------------------------------
    // Phase 3: scoring with cluster compensation
    // ------------------------------------------------------------------

    /// Split a read at its seed and score both halves against the reference
    /// around `location`: tail forward from the seed, head backward into it.
    fn score_location(
        &mut self,
        which_read: usize,
        direction: Direction,
        location: GenomeLocation,
        seed_offset: u32,
        score_limit: u32,
    ) -> Option<(u32, f64, i32)> {
        self.n_locations_scored += 1;
        let seed_offset = seed_offset as usize;
        let slack = score_limit as usize;
        let data = self.reads[which_read].bases(direction);
        if seed_offset >= data.len() {
            return None;
        }

        let tail = &data[seed_offset..];
        let tail_start = location.saturating_add(seed_offset as u64);
        let tail_ref = self.index.reference_slice(tail_start, tail.len() + slack);
        let tail_result = self.forward_scorer.score(tail, tail_ref, score_limit)?;

        let head = &data[..seed_offset];
        let head_result = if head.is_empty() {
            ScoredAlignment {
                score: 0,
                match_probability: 1.0,
                location_offset: 0,
            }
        } else {
            let head_ref_start = tail_start.saturating_sub((head.len() + slack) as u64);
            let head_ref = self
                .index
                .reference_slice(head_ref_start, (tail_start - head_ref_start) as usize);
            self.reverse_scorer
                .score(head, head_ref, score_limit - tail_result.score)?
        };

        Some((
            tail_result.score + head_result.score,
            tail_result.match_probability * head_result.match_probability,
            head_result.location_offset,
        ))
    }

    /// Fewer-end score for a candidate, cached across scoring passes.
    fn ensure_fewer_score(&mut self, ci: u32, score_limit: u32) -> Option<(u32, f64, i32)> {
        match self.pools.candidates[ci as usize].fewer_end_score {
            CachedScore::Scored {
                score,
                match_probability,
                location_offset,
            } => Some((score, match_probability, location_offset)),
            CachedScore::OverLimit { limit } if limit >= score_limit => None,
            _ => {
                let cand = self.pools.candidates[ci as usize];
                let fewer = self.read_with_fewer_hits;
                let direction = direction_of(cand.which_set_pair, fewer);
                let result = self.score_location(
                    fewer,
                    direction,
                    cand.location,
                    cand.seed_offset,
                    score_limit,
                );
                self.pools.candidates[ci as usize].fewer_end_score = match result {
                    Some((score, match_probability, location_offset)) => CachedScore::Scored {
                        score,
                        match_probability,
                        location_offset,
                    },
                    None => CachedScore::OverLimit { limit: score_limit },
                };
                result
            }
        }
    }

    /// Mate score, cached with the limit it was computed under so a pass
    /// that needs more depth rescores.
    fn ensure_mate_score(
        &mut self,
        which_set_pair: usize,
        mate_index: usize,
        score_limit: u32,
    ) -> Option<(u32, f64, i32)> {
        match self.pools.mates[which_set_pair][mate_index].score {
            CachedScore::Scored {
                score,
                match_probability,
                location_offset,
            } => Some((score, match_probability, location_offset)),
            CachedScore::OverLimit { limit } if limit >= score_limit => None,
            _ => {
                let mate = self.pools.mates[which_set_pair][mate_index];
                let more = 1 - self.read_with_fewer_hits;
                let direction = direction_of(which_set_pair, more);
                let result = self.score_location(
                    more,
                    direction,
                    mate.location,
                    mate.seed_offset,
                    score_limit,
                );
                self.pools.mates[which_set_pair][mate_index].score = match result {
                    Some((score, match_probability, location_offset)) => CachedScore::Scored {
                        score,
                        match_probability,
                        location_offset,
                    },
                    None => CachedScore::OverLimit { limit: score_limit },
                };
                result
            }
        }
    }

    #[inline]
    fn apply_offset(location: GenomeLocation, offset: i32) -> GenomeLocation {
        (location as i64 + offset as i64).max(0) as GenomeLocation
    }

    /// Merge a scored placement into the anchor pool.
    fn merge_placement(
        &mut self,
        ci: u32,
        mate_index: u32,
        fewer_raw: GenomeLocation,
        more_raw: GenomeLocation,
        placement: PairPlacement,
    ) -> Result<(), AlignError> {
        let mut found: Option<u32> = None;
        for (ai, anchor) in self.pools.anchors.iter().enumerate() {
            if anchor.matches(fewer_raw, more_raw, MAX_MERGE_DISTANCE) {
                found = Some(ai as u32);
                break;
            }
        }
        match found {
            Some(ai) => {
                let anchor = &mut self.pools.anchors[ai as usize];
                if anchor.consider(&placement) {
                    anchor.candidate = ci;
                    anchor.mate = mate_index;
                    self.pools.candidates[ci as usize].merge_anchor = Some(ai);
                }
            }
            None => {
                let ai = self.pools.push_anchor(MergeAnchor::new(
                    fewer_raw, more_raw, placement, ci, mate_index,
                ))?;
                self.pools.candidates[ci as usize].merge_anchor = Some(ai);
            }
        }
        Ok(())
    }

    /// Whether a candidate qualifies for cluster compensation. During the
    /// first scoring pass every tagged candidate counts; correction passes
    /// additionally require the shared counter at its locus to have reached
    /// `min_cluster_size`.
    fn is_clustered(&self, candidate: &ScoringCandidate, min_cluster_size: Option<u8>) -> bool {
        if !candidate.cluster.is_cluster() {
            return false;
        }
        match min_cluster_size {
            None => true,
            Some(min) => self.cluster.count(candidate.location) >= min,
        }
    }

    /// Score one candidate against every mate in its window, merging each
    /// valid pair into the anchors and accumulating the pair-probability
    /// total.
    fn score_candidate(
        &mut self,
        ci: u32,
        min_cluster_size: Option<u8>,
        probability_of_all_pairs: &mut f64,
    ) -> Result<(), AlignError> {
        let cand = self.pools.candidates[ci as usize];
        let score_limit = self.opt.max_k + self.opt.extra_search_depth;
        let fewer_limit = score_limit.saturating_sub(cand.mate_lower_bound);
        let Some((fewer_score, fewer_probability, fewer_offset)) =
            self.ensure_fewer_score(ci, fewer_limit)
        else {
            return Ok(());
        };

        let clustered = self.is_clustered(&cand, min_cluster_size);
        let min_spacing = self.opt.min_spacing as u64;
        let max_spacing = self.opt.max_spacing as u64;

        let mut mi = cand.mate_index as i64;
        while mi >= 0 {
            let mate = self.pools.mates[cand.which_set_pair][mi as usize];
            if !locations_within(mate.location, cand.location, max_spacing) {
                // Walked above the window; the array is descending, so done.
                break;
            }
            if distance_between(mate.location, cand.location) < min_spacing {
                mi -= 1;
                continue;
            }
            let mate_limit = score_limit.saturating_sub(fewer_score);
            if mate.best_possible_score > mate_limit {
                mi -= 1;
                continue;
            }
            if let Some((mate_score, mate_probability, mate_offset)) =
                self.ensure_mate_score(cand.which_set_pair, mi as usize, mate_limit)
            {
                let pair_score = (fewer_score + mate_score) as i32;
                let compensated_score = if clustered {
                    pair_score - self.opt.cluster_ed_compensation as i32
                } else {
                    pair_score
                };
                let pair_probability = if clustered {
                    fewer_probability * mate_probability
                } else {
                    fewer_probability * mate_probability * self.opt.unclustered_penalty
                };
                // Suppressed or not, every observed pair counts here.
                *probability_of_all_pairs += pair_probability;

                let placement = PairPlacement {
                    fewer_location: Self::apply_offset(cand.location, fewer_offset),
                    more_location: Self::apply_offset(mate.location, mate_offset),
                    fewer_score,
                    more_score: mate_score,
                    pair_probability,
                    compensated_score,
                    which_set_pair: cand.which_set_pair,
                    cluster: cand.cluster,
                };
                self.merge_placement(ci, mi as u32, cand.location, mate.location, placement)?;
            }
            mi -= 1;
        }
        Ok(())
    }

    /// One full scoring pass over the buckets in ascending best-possible
    /// order. Rebuilds the anchors from scratch, so passes are repeatable;
    /// cached Landau-Vishkin results are reused where their limits allow.
    fn scoring_pass(&mut self, min_cluster_size: Option<u8>) -> Result<PassStats, AlignError> {
        self.pools.reset_anchors();
        let mut probability_of_all_pairs = 0.0;
        for bucket in 0..=self.max_used_bucket.min(self.buckets.len() - 1) {
            let mut next = self.buckets[bucket];
            while let Some(ci) = next {
                next = self.pools.candidates[ci as usize].next_in_bucket;
                self.score_candidate(ci, min_cluster_size, &mut probability_of_all_pairs)?;
            }
        }

        // The best pair is the best surviving anchor.
        let mut best_score = UNSET_SCORE;
        let mut best_anchor: Option<u32> = None;
        let mut best_probability = 0.0;
        let mut best_location = GenomeLocation::MAX;
        for (ai, anchor) in self.pools.anchors.iter().enumerate() {
            let b = &anchor.best;
            let better = b.compensated_score < best_score
                || (b.compensated_score == best_score
                    && (b.pair_probability > best_probability
                        || (b.pair_probability == best_probability
                            && b.fewer_location < best_location)));
            if better {
                best_score = b.compensated_score;
                best_probability = b.pair_probability;
                best_location = b.fewer_location;
                best_anchor = Some(ai as u32);
            }
        }

        Ok(PassStats {
            best_score,
            best_anchor,
            probability_of_all_pairs,
        })
    }

    /// Score every candidate treating all cluster tags as valid. Updates
    /// `best_compensated_score` unless `in_revise` is set.
    pub fn align_phase_3_score(
        &mut self,
        best_compensated_score: &mut i32,
        in_revise: bool,
    ) -> Result<(), AlignError> {
        let stats = self.scoring_pass(None)?;
        self.probability_of_all_pairs = stats.probability_of_all_pairs;
        if !in_revise {
            *best_compensated_score = stats.best_score;
        }
        log::debug!(
            "phase 3 score: best {}, {} anchors, total probability {:.3e}",
            stats.best_score,
            self.pools.anchors.len(),
            stats.probability_of_all_pairs
        );
        Ok(())
    }

    /// Bump the shared cluster counters at the loci of the current best pair
    /// and mark them in the toggle stripe. The driver must hold exclusive
    /// writer access for the region.
    pub fn align_phase_3_increment_cluster(&mut self, best_compensated_score: i32) {
        let best = self
            .pools
            .anchors
            .iter()
            .filter(|a| a.best.compensated_score == best_compensated_score)
            .min_by(|a, b| {
                b.best
                    .pair_probability
                    .partial_cmp(&a.best.pair_probability)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.best.fewer_location.cmp(&b.best.fewer_location))
            });
        if let Some(anchor) = best {
            for loc in [anchor.best.fewer_location, anchor.best.more_location] {
                self.cluster.increment(loc);
                self.cluster.set_toggle(loc, true);
            }
        }
    }

    /// Re-score with cluster membership gated on the shared counters.
    /// Returns true when the best compensated score changed, meaning cluster
    /// membership flipped a placement and the caller should iterate.
    pub fn align_phase_3_correct_best_score(
        &mut self,
        best_compensated_score: &mut i32,
        min_cluster_size: u8,
    ) -> Result<bool, AlignError> {
        let stats = self.scoring_pass(Some(min_cluster_size))?;
        self.probability_of_all_pairs = stats.probability_of_all_pairs;
        let changed = stats.best_score != *best_compensated_score;
        *best_compensated_score = stats.best_score;
        Ok(changed)
    }

    fn count_secondaries(&self, best_score: i32, best_anchor: Option<u32>, max_ed: u32) -> usize {
        let Some(best_ai) = best_anchor else { return 0 };
        let cutoff = best_score.saturating_add(max_ed as i32);
        self.pools
            .anchors
            .iter()
            .enumerate()
            .filter(|(ai, a)| *ai as u32 != best_ai && a.best.compensated_score <= cutoff)
            .count()
    }

    /// Count the results a generate pass would emit. Returns true when
    /// `secondary_buffer_size` is too small and the caller must grow its
    /// buffer and replay.
    #[allow(clippy::too_many_arguments)]
    pub fn align_phase_3_count_results(
        &mut self,
        max_edit_distance_for_secondary_results: u32,
        best_compensated_score: &mut i32,
        min_cluster_size: u8,
        n_secondary_results: &mut usize,
        secondary_buffer_size: usize,
        probability_of_all_pairs: &mut f64,
    ) -> Result<bool, AlignError> {
        let stats = self.scoring_pass(Some(min_cluster_size))?;
        self.probability_of_all_pairs = stats.probability_of_all_pairs;
        *best_compensated_score = stats.best_score;
        *probability_of_all_pairs = stats.probability_of_all_pairs;
        let n = self.count_secondaries(
            stats.best_score,
            stats.best_anchor,
            max_edit_distance_for_secondary_results,
        );
        *n_secondary_results = n;
        Ok(n > secondary_buffer_size)
    }

    fn result_from_anchor(&self, anchor: &MergeAnchor) -> PairedAlignmentResult {
        let p = &anchor.best;
        let fewer = self.read_with_fewer_hits;
        let more = 1 - fewer;
        let mut result = PairedAlignmentResult::unmapped();
        result.status = [AlignmentStatus::MultipleHits; NUM_READS_PER_PAIR];
        result.location[fewer] = p.fewer_location;
        result.location[more] = p.more_location;
        result.direction[fewer] = direction_of(p.which_set_pair, fewer);
        result.direction[more] = direction_of(p.which_set_pair, more);
        result.score[fewer] = p.fewer_score;
        result.score[more] = p.more_score;
        result.probability = p.pair_probability;
        result.compensated_score = p.compensated_score;
        result.cluster = p.cluster;
        result
    }

    /// Write the best result and the qualifying secondaries. The secondary
    /// vector is cleared first; `align_phase_3_count_results` tells the
    /// caller how much room it needs.
    pub fn align_phase_3_generate_results(
        &mut self,
        min_cluster_size: u8,
        max_edit_distance_for_secondary_results: u32,
        best_compensated_score: &mut i32,
        secondary_results: &mut Vec<PairedAlignmentResult>,
    ) -> Result<PairedAlignmentResult, AlignError> {
        let stats = self.scoring_pass(Some(min_cluster_size))?;
        self.probability_of_all_pairs = stats.probability_of_all_pairs;
        *best_compensated_score = stats.best_score;

        secondary_results.clear();
        let Some(best_ai) = stats.best_anchor else {
            return Ok(PairedAlignmentResult::unmapped());
        };
        let cutoff = stats
            .best_score
            .saturating_add(max_edit_distance_for_secondary_results as i32);
        for (ai, anchor) in self.pools.anchors.iter().enumerate() {
            if ai as u32 != best_ai && anchor.best.compensated_score <= cutoff {
                secondary_results.push(self.result_from_anchor(anchor));
            }
        }
        Ok(self.result_from_anchor(&self.pools.anchors[best_ai as usize]))
    }

    // ------------------------------------------------------------------
    // Phase 4: MAPQ, deduplication, caps, emission
    // ------------------------------------------------------------------

    fn note_contig_hit(&mut self, location: GenomeLocation) -> i32 {
        let contig = self.index.contig_of(location);
        let entry = &mut self.contig_counts[contig];
        if entry.epoch != self.contig_count_epoch {
            entry.epoch = self.contig_count_epoch;
            entry.hits = 0;
        }
        entry.hits += 1;
        entry.hits
    }

    /// Finalize: near-duplicate suppression against the best result, ranked
    /// ordering, the per-contig cap, truncation, and MAPQ assignment.
    pub fn align_phase_4(
        &mut self,
        best_result: &mut PairedAlignmentResult,
        secondary_results: &mut Vec<PairedAlignmentResult>,
        max_secondary_results: usize,
        popular_seeds_skipped: u32,
    ) {
        if !best_result.is_mapped() || best_result.compensated_score == UNSET_SCORE {
            *best_result = PairedAlignmentResult::unmapped();
            secondary_results.clear();
            return;
        }

        let fewer = self.read_with_fewer_hits;
        let probability_of_all_pairs = self.probability_of_all_pairs;

        // Anything near the best on both ends is the same placement.
        let best_snapshot = *best_result;
        secondary_results.retain(|s| {
            !(locations_within(s.location[0], best_snapshot.location[0], MAX_MERGE_DISTANCE)
                && locations_within(s.location[1], best_snapshot.location[1], MAX_MERGE_DISTANCE))
        });

        // Rank: best first by compensated score, then probability, then
        // fewer-side location for determinism.
        secondary_results.sort_by(|a, b| {
            a.compensated_score
                .cmp(&b.compensated_score)
                .then_with(|| {
                    b.probability
                        .partial_cmp(&a.probability)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.location[fewer].cmp(&b.location[fewer]))
        });

        // Pairwise near-duplicate suppression among the survivors; earlier
        // entries rank better, so they win.
        let mut kept: Vec<PairedAlignmentResult> = Vec::with_capacity(secondary_results.len());
        for s in secondary_results.drain(..) {
            let duplicate = kept.iter().any(|k| {
                locations_within(s.location[0], k.location[0], MAX_MERGE_DISTANCE)
                    && locations_within(s.location[1], k.location[1], MAX_MERGE_DISTANCE)
            });
            if !duplicate {
                kept.push(s);
            }
        }
        *secondary_results = kept;

        if let Some(cap) = self.opt.max_secondary_alignments_per_contig {
            let mut counted = std::mem::take(secondary_results);
            self.note_contig_hit(best_snapshot.location[fewer]);
            counted.retain(|s| self.note_contig_hit(s.location[fewer]) <= cap as i32);
            *secondary_results = counted;
        }

        secondary_results.truncate(max_secondary_results);

        let mapq = compute_mapq(
            best_result.probability,
            probability_of_all_pairs,
            popular_seeds_skipped,
        );
        best_result.mapq = [mapq; NUM_READS_PER_PAIR];
        let status = if mapq >= 10 {
            AlignmentStatus::SingleHit
        } else {
            AlignmentStatus::MultipleHits
        };
        best_result.status = [status; NUM_READS_PER_PAIR];
        for s in secondary_results.iter_mut() {
            let q = compute_mapq(s.probability, probability_of_all_pairs, popular_seeds_skipped);
            s.mapq = [q; NUM_READS_PER_PAIR];
            s.status = [AlignmentStatus::MultipleHits; NUM_READS_PER_PAIR];
        }

        log::debug!(
            "phase 4: best at {:?} mapq {}, {} secondaries",
            best_result.location,
            mapq,
            secondary_results.len()
        );
    }

    // ------------------------------------------------------------------
    // Whole-pair convenience driver
    // ------------------------------------------------------------------

    /// Align one pair end to end, without cluster targeting: phase 1, the
    /// full untagged intersection, scoring with a bounded correction loop,
    /// and finalization. Cluster-aware drivers interleave the phase entry
    /// points themselves instead.
    pub fn align(
        &mut self,
        read0: &[u8],
        read1: &[u8],
        max_edit_distance_for_secondary_results: u32,
        min_cluster_size: u8,
        max_secondary_results: usize,
        secondary_results: &mut Vec<PairedAlignmentResult>,
    ) -> Result<PairedAlignmentResult, AlignError> {
        secondary_results.clear();
        if self.align_phase_1(read0, read1) {
            return Ok(PairedAlignmentResult::unmapped());
        }
        if !self.align_phase_2_init() {
            return Ok(PairedAlignmentResult::unmapped());
        }
        self.align_phase_2()?;

        let mut best = UNSET_SCORE;
        self.align_phase_3_score(&mut best, false)?;

        let mut flagged = false;
        let mut revisions = 0;
        while self.align_phase_3_correct_best_score(&mut best, min_cluster_size)? {
            revisions += 1;
            if revisions >= MAX_SCORE_REVISIONS {
                log::warn!(
                    "cluster correction did not settle after {} passes; flagging pair for review",
                    MAX_SCORE_REVISIONS
                );
                flagged = true;
                break;
            }
        }

        let mut n_secondary = 0usize;
        let mut probability_of_all_pairs = 0.0;
        let mut buffer_size = secondary_results.capacity().max(8);
        while self.align_phase_3_count_results(
            max_edit_distance_for_secondary_results,
            &mut best,
            min_cluster_size,
            &mut n_secondary,
            buffer_size,
            &mut probability_of_all_pairs,
        )? {
            buffer_size *= 2;
            log::debug!("secondary buffer too small; retrying with {}", buffer_size);
        }
        secondary_results.reserve(n_secondary);

        let mut best_result = self.align_phase_3_generate_results(
            min_cluster_size,
            max_edit_distance_for_secondary_results,
            &mut best,
            secondary_results,
        )?;
        self.align_phase_4(
            &mut best_result,
            secondary_results,
            max_secondary_results,
            self.popular_seeds_skipped.iter().sum(),
        );
        best_result.flagged_for_review = flagged;
        Ok(best_result)
    }
}
