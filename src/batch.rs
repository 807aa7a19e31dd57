// Read-pair-level parallelism.
//
// One aligner instance per rayon worker; instances share the read-only index
// and the cluster stripes but never their scratch. Mutating cluster calls
// (align_phase_3_increment_cluster) are the molecule driver's job and are
// deliberately absent here.

use rayon::prelude::*;

use crate::cluster::ClusterCounters;
use crate::edit_distance::EditDistanceScorer;
use crate::genome::GenomeIndex;
use crate::pair_aligner::PairAligner;
use crate::pair_opt::PairOpt;
use crate::results::PairedAlignmentResult;

/// Everything align() produces for one pair.
#[derive(Debug, Clone)]
pub struct AlignedPair {
    pub best: PairedAlignmentResult,
    pub secondary: Vec<PairedAlignmentResult>,
    pub popular_seeds_skipped: [u32; 2],
}

/// Align a batch of pairs across the rayon pool. `make_scorers` is invoked
/// once per worker to build that worker's forward and reverse engines.
///
/// A pair that exhausts its pools is reported unmapped and logged; it never
/// aborts the batch.
#[allow(clippy::too_many_arguments)]
pub fn align_pairs<I, F>(
    index: &I,
    opt: &PairOpt,
    cluster: &ClusterCounters,
    make_scorers: F,
    pairs: &[(Vec<u8>, Vec<u8>)],
    max_edit_distance_for_secondary_results: u32,
    min_cluster_size: u8,
    max_secondary_results: usize,
) -> Vec<AlignedPair>
where
    I: GenomeIndex,
    F: Fn() -> (Box<dyn EditDistanceScorer>, Box<dyn EditDistanceScorer>) + Sync + Send,
{
    pairs
        .par_iter()
        .map_init(
            || {
                let (forward, reverse) = make_scorers();
                PairAligner::new(index, opt.clone(), forward, reverse, cluster)
            },
            |aligner, (read0, read1)| {
                let mut secondary = Vec::new();
                let best = match aligner.align(
                    read0,
                    read1,
                    max_edit_distance_for_secondary_results,
                    min_cluster_size,
                    max_secondary_results,
                    &mut secondary,
                ) {
                    Ok(best) => best,
                    Err(e) => {
                        log::error!("dropping pair: {}", e);
                        secondary.clear();
                        PairedAlignmentResult::unmapped()
                    }
                };
                AlignedPair {
                    best,
                    secondary,
                    popular_seeds_skipped: aligner.popular_seeds_skipped(),
                }
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BandedEditDistance, ToyIndex};

    #[test]
    fn batch_matches_sequential_alignment() {
        let reference = crate::test_support::random_reference(4000, 11);
        let read0 = reference[100..148].to_vec();
        let read1 = crate::test_support::revcomp(&reference[450..498]);
        let index = ToyIndex::build(reference, 16);
        let cluster = ClusterCounters::new(4000);
        let opt = PairOpt {
            max_spacing: 1000,
            ..PairOpt::default()
        };

        let pairs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..8).map(|_| (read0.clone(), read1.clone())).collect();
        let batched = align_pairs(
            &index,
            &opt,
            &cluster,
            || {
                (
                    BandedEditDistance::forward(),
                    BandedEditDistance::reverse(),
                )
            },
            &pairs,
            2,
            2,
            10,
        );

        let mut aligner = PairAligner::new(
            &index,
            opt.clone(),
            BandedEditDistance::forward(),
            BandedEditDistance::reverse(),
            &cluster,
        );
        let mut secondary = Vec::new();
        let expected = aligner
            .align(&read0, &read1, 2, 2, 10, &mut secondary)
            .unwrap();

        assert_eq!(batched.len(), 8);
        for out in batched {
            assert_eq!(out.best, expected);
            assert_eq!(out.secondary, secondary);
        }
    }
}
