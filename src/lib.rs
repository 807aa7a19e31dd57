// linked-align: intersection-based paired-end alignment core for linked reads.
//
// The crate aligns a read pair by intersecting seed hit lists for the two
// orientation-consistent set pairs, scoring candidate placements with an
// external Landau-Vishkin engine, and discounting placements that co-localize
// with other read pairs from the same molecule (a "cluster").

pub mod batch;
pub mod candidates;
pub mod cluster;
pub mod edit_distance;
pub mod errors;
pub mod genome;
pub mod hit_set;
pub mod pair_aligner;
pub mod pair_opt;
pub mod reads;
pub mod results;

pub use cluster::{ClusterCounters, ClusterTag};
pub use edit_distance::{EditDistanceScorer, ScoredAlignment};
pub use errors::AlignError;
pub use genome::{Direction, GenomeIndex, GenomeLocation, HitSlice, SeedHits};
pub use pair_aligner::PairAligner;
pub use pair_opt::PairOpt;
pub use results::{AlignmentStatus, PairedAlignmentResult};

// Test modules
#[cfg(test)]
pub(crate) mod test_support;
