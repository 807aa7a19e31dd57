// Aligner options.
//
// One struct, filled in by the caller and copied into each aligner instance
// at construction. Defaults suit short Illumina pairs against a mammalian
// reference.

/// Hard cap on seeds per read regardless of coverage settings.
pub const MAX_MAX_SEEDS: usize = 30;

/// Bound on the phase-3 cluster-correction loop; hitting it flags the pair.
pub const MAX_SCORE_REVISIONS: usize = 4;

/// Two placements merge when both ends land within this many bases.
pub const MAX_MERGE_DISTANCE: u64 = 50;

#[derive(Debug, Clone)]
pub struct PairOpt {
    /// Maximum edit distance per end for a reportable alignment.
    pub max_k: u32,
    /// Extra edit-distance headroom searched so secondaries near the best are
    /// still found.
    pub extra_search_depth: u32,
    /// Fixed seed count per read; 0 derives the count from `seed_coverage`.
    pub num_seeds: usize,
    /// Seeds per read as coverage: seeds = seed_coverage * readLen / seedLen.
    /// Only used when `num_seeds` is 0.
    pub seed_coverage: f64,
    /// Minimum distance between the two ends of a pair (inclusive).
    pub min_spacing: u32,
    /// Maximum distance between the two ends of a pair (inclusive).
    pub max_spacing: u32,
    /// Seeds whose hit list exceeds this in both orientations are skipped as
    /// overly popular.
    pub max_big_hits: u32,
    /// Cap on the scoring-candidate pool (and the per-set-pair mate pools and
    /// merge-anchor pool, which are sized to match).
    pub max_candidate_pool_size: usize,
    /// Cap on reported secondaries per contig; `None` disables the cap.
    pub max_secondary_alignments_per_contig: Option<usize>,
    /// Edit-distance discount for placements in a sufficiently large cluster.
    pub cluster_ed_compensation: u32,
    /// Probability multiplier (<= 1) applied to unclustered pairs.
    pub unclustered_penalty: f64,
}

impl Default for PairOpt {
    fn default() -> PairOpt {
        PairOpt {
            max_k: 10,
            extra_search_depth: 2,
            num_seeds: 0,
            seed_coverage: 2.0,
            min_spacing: 50,
            max_spacing: 1000,
            max_big_hits: 2000,
            max_candidate_pool_size: 1_000_000,
            max_secondary_alignments_per_contig: None,
            cluster_ed_compensation: 0,
            unclustered_penalty: 1.0,
        }
    }
}

impl PairOpt {
    /// Number of seeds to attempt for a read of `read_len`.
    pub fn seeds_to_use(&self, read_len: usize, seed_len: usize) -> usize {
        let wanted = if self.num_seeds != 0 {
            self.num_seeds
        } else {
            (self.seed_coverage * read_len as f64 / seed_len as f64).round() as usize
        };
        wanted.clamp(1, MAX_MAX_SEEDS)
    }

    /// Upper bound used to size the candidate, mate and anchor pools.
    pub fn candidate_pool_size(&self, max_seeds: usize) -> usize {
        (self.max_big_hits as usize * max_seeds * 2).min(self.max_candidate_pool_size)
    }
}
