// End-to-end tests for the paired alignment core over a small in-memory
// genome. The genome index and the edit-distance engines are implemented
// here the way an embedding application would implement them, so these tests
// exercise exactly the public surface.

use std::collections::HashMap;

use linked_align::{
    AlignmentStatus, ClusterCounters, ClusterTag, Direction, EditDistanceScorer, GenomeIndex,
    GenomeLocation, HitSlice, PairAligner, PairOpt, PairedAlignmentResult, ScoredAlignment,
    SeedHits,
};

const SEED_LEN: usize = 16;
const READ_LEN: usize = 48;

// ----------------------------------------------------------------------------
// External collaborators: a toy genome index and a plain scorer
// ----------------------------------------------------------------------------

struct TinyGenome {
    reference: Vec<u8>,
    seeds: HashMap<Vec<u8>, Vec<u64>>,
}

impl TinyGenome {
    fn new(reference: Vec<u8>) -> TinyGenome {
        let mut seeds: HashMap<Vec<u8>, Vec<u64>> = HashMap::new();
        for start in 0..=reference.len().saturating_sub(SEED_LEN) {
            seeds
                .entry(reference[start..start + SEED_LEN].to_vec())
                .or_default()
                .push(start as u64);
        }
        for hits in seeds.values_mut() {
            hits.sort_unstable_by(|a, b| b.cmp(a));
        }
        TinyGenome { reference, seeds }
    }

    fn hits(&self, seed: &[u8]) -> HitSlice<'_> {
        static NO_HITS: [u64; 0] = [];
        match self.seeds.get(seed) {
            Some(hits) => HitSlice::Wide(hits),
            None => HitSlice::Wide(&NO_HITS),
        }
    }
}

impl GenomeIndex for TinyGenome {
    fn seed_len(&self) -> usize {
        SEED_LEN
    }

    fn genome_len(&self) -> GenomeLocation {
        self.reference.len() as GenomeLocation
    }

    fn lookup(&self, seed: &[u8]) -> SeedHits<'_> {
        let rc = revcomp(seed);
        SeedHits {
            forward: self.hits(seed),
            reverse_complement: self.hits(&rc),
        }
    }

    fn contig_count(&self) -> usize {
        1
    }

    fn contig_of(&self, _location: GenomeLocation) -> usize {
        0
    }

    fn reference_slice(&self, location: GenomeLocation, len: usize) -> &[u8] {
        let start = (location as usize).min(self.reference.len());
        let end = (start + len).min(self.reference.len());
        &self.reference[start..end]
    }
}

/// Levenshtein distance of the pattern against a prefix of the text, the
/// shortest-prefix minimum taken so trailing text is free. The reverse
/// instance anchors at the ends instead by flipping both inputs.
struct SimpleEditDistance {
    end_anchored: bool,
}

impl EditDistanceScorer for SimpleEditDistance {
    fn score(&mut self, pattern: &[u8], text: &[u8], score_limit: u32) -> Option<ScoredAlignment> {
        let flip = |s: &[u8]| -> Vec<u8> { s.iter().rev().copied().collect() };
        let (p, t) = if self.end_anchored {
            (flip(pattern), flip(text))
        } else {
            (pattern.to_vec(), text.to_vec())
        };
        if p.is_empty() {
            return Some(ScoredAlignment {
                score: 0,
                match_probability: 1.0,
                location_offset: 0,
            });
        }
        let mut row: Vec<u32> = (0..=t.len() as u32).collect();
        for (i, &pb) in p.iter().enumerate() {
            let mut diagonal = row[0];
            row[0] = i as u32 + 1;
            for j in 1..=t.len() {
                let substitution = diagonal + u32::from(pb != t[j - 1]);
                diagonal = row[j];
                row[j] = substitution.min(diagonal + 1).min(row[j - 1] + 1);
            }
        }
        let score = *row.iter().min().expect("non-empty row");
        if score > score_limit {
            return None;
        }
        let matched = p.len() as u32 - score.min(p.len() as u32);
        Some(ScoredAlignment {
            score,
            match_probability: 0.999f64.powi(matched as i32) * 0.001f64.powi(score as i32),
            location_offset: 0,
        })
    }
}

fn scorers() -> (Box<dyn EditDistanceScorer>, Box<dyn EditDistanceScorer>) {
    (
        Box::new(SimpleEditDistance { end_anchored: false }),
        Box::new(SimpleEditDistance { end_anchored: true }),
    )
}

// ----------------------------------------------------------------------------
// Fixture helpers
// ----------------------------------------------------------------------------

fn revcomp(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'T' => b'A',
            b'C' => b'G',
            b'G' => b'C',
            other => other,
        })
        .collect()
}

/// Deterministic pseudo-random reference; xorshift so the tests carry no
/// extra dependencies.
fn scrambled_reference(len: usize, mut state: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            b"ACGT"[(state % 4) as usize]
        })
        .collect()
}

fn plant(reference: &mut [u8], at: usize, block: &[u8]) {
    reference[at..at + block.len()].copy_from_slice(block);
}

fn opt() -> PairOpt {
    PairOpt {
        min_spacing: 50,
        max_spacing: 1000,
        ..PairOpt::default()
    }
}

fn aligner<'a>(genome: &'a TinyGenome, opt: PairOpt, cluster: &'a ClusterCounters) -> PairAligner<'a, TinyGenome> {
    let (forward, reverse) = scorers();
    PairAligner::new(genome, opt, forward, reverse, cluster)
}

/// The universal invariants from the design: spacing bounds, orientation,
/// ranking, and pairwise separation of emitted results.
fn check_invariants(
    best: &PairedAlignmentResult,
    secondary: &[PairedAlignmentResult],
    opt: &PairOpt,
) {
    let mut all = vec![*best];
    all.extend_from_slice(secondary);
    for r in &all {
        let spacing = r.location[0].abs_diff(r.location[1]);
        assert!(spacing >= opt.min_spacing as u64 && spacing <= opt.max_spacing as u64);
        assert_ne!(r.direction[0], r.direction[1], "exactly one end must be RC");
    }
    for s in secondary {
        assert!(
            (s.compensated_score, -s.probability)
                >= (best.compensated_score, -best.probability),
            "secondary ranks better than best"
        );
    }
    for i in 0..all.len() {
        for j in i + 1..all.len() {
            let both_close = all[i].location[0].abs_diff(all[j].location[0]) <= 50
                && all[i].location[1].abs_diff(all[j].location[1]) <= 50;
            assert!(!both_close, "two emitted results share a merge window");
        }
    }
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn unique_placement_maps_confidently() {
    let reference = scrambled_reference(1000, 0xabcdef);
    let read0 = reference[100..100 + READ_LEN].to_vec();
    let read1 = revcomp(&reference[450..450 + READ_LEN]);
    let genome = TinyGenome::new(reference);
    let cluster = ClusterCounters::new(1000);
    let mut aligner = aligner(&genome, opt(), &cluster);

    let mut secondary = Vec::new();
    let best = aligner
        .align(&read0, &read1, 2, 2, 10, &mut secondary)
        .unwrap();

    assert_eq!(best.location, [100, 450]);
    assert_eq!(best.mapq, [70, 70]);
    assert_eq!(best.score, [0, 0]);
    assert_eq!(best.status, [AlignmentStatus::SingleHit; 2]);
    assert_eq!(
        best.direction,
        [Direction::Forward, Direction::ReverseComplement]
    );
    assert!(secondary.is_empty());
    check_invariants(&best, &secondary, &opt());
}

#[test]
fn two_far_placements_split_the_mapq() {
    let mut reference = scrambled_reference(101_000, 0x1234);
    let block0 = scrambled_reference(READ_LEN, 0x51);
    let block1 = scrambled_reference(READ_LEN, 0x52);
    plant(&mut reference, 100, &block0);
    plant(&mut reference, 450, &block1);
    plant(&mut reference, 100_000, &block0);
    plant(&mut reference, 100_350, &block1);
    let read1 = revcomp(&block1);
    let genome = TinyGenome::new(reference);
    let cluster = ClusterCounters::new(101_000);
    let mut aligner = aligner(&genome, opt(), &cluster);

    let mut secondary = Vec::new();
    let best = aligner
        .align(&block0, &read1, 2, 2, 10, &mut secondary)
        .unwrap();

    // Two equally good placements: the winner explains half the mass.
    assert_eq!(best.mapq, [3, 3]);
    assert_eq!(secondary.len(), 1);
    let locations = [best.location, secondary[0].location];
    assert!(locations.contains(&[100, 450]));
    assert!(locations.contains(&[100_000, 100_350]));
    check_invariants(&best, &secondary, &opt());
}

#[test]
fn adjacent_placements_merge_into_one_result() {
    // A 49-base homopolymer holds the read perfectly at two adjacent
    // offsets (and nearly at many more). All of them fall inside one merge
    // window, so a single result comes out, with the probability mass of
    // every suppressed placement still lowering its MAPQ.
    let mut reference = scrambled_reference(1000, 0x77);
    plant(&mut reference, 100, &vec![b'A'; 49]);
    plant(&mut reference, 450, &vec![b'C'; 49]);
    let read0 = vec![b'A'; READ_LEN];
    let read1 = vec![b'G'; READ_LEN]; // revcomp of the C run
    let genome = TinyGenome::new(reference);
    let cluster = ClusterCounters::new(1000);
    let mut aligner = aligner(&genome, opt(), &cluster);

    let mut secondary = Vec::new();
    let best = aligner
        .align(&read0, &read1, 2, 2, 10, &mut secondary)
        .unwrap();

    assert!(best.is_mapped());
    assert!(secondary.is_empty(), "near-duplicates must merge");
    assert!(best.location[0].abs_diff(100) <= 2);
    assert!(best.location[1].abs_diff(450) <= 2);
    assert!(best.mapq[0] < 70, "suppressed placements still cost MAPQ");
    check_invariants(&best, &secondary, &opt());
}

#[test]
fn fully_popular_read_comes_back_unmapped() {
    let mut reference = scrambled_reference(20_000, 0x99);
    let block = scrambled_reference(READ_LEN, 0x42);
    let rc_block = revcomp(&block);
    for k in 0..6 {
        plant(&mut reference, 1000 + 1000 * k, &block);
        plant(&mut reference, 10_000 + 1000 * k, &rc_block);
    }
    let genome = TinyGenome::new(reference.clone());
    let cluster = ClusterCounters::new(20_000);
    let options = PairOpt {
        max_big_hits: 4,
        num_seeds: 3,
        ..opt()
    };
    let mut aligner = aligner(&genome, options, &cluster);

    let read1 = reference[300..300 + READ_LEN].to_vec();
    let mut secondary = Vec::new();
    let best = aligner.align(&block, &read1, 2, 2, 10, &mut secondary).unwrap();

    assert!(!best.is_mapped());
    assert_eq!(best.status, [AlignmentStatus::NotFound; 2]);
    assert_eq!(aligner.popular_seeds_skipped(), [3, 0]);
    assert!(secondary.is_empty());
}

#[test]
fn clustered_placement_beats_a_slightly_better_loner() {
    // Pair A carries one mismatch but sits in a big cluster; pair B is
    // perfect but alone. With a compensation of 2, A must win; with the
    // counters cleared, B must.
    let mut reference = scrambled_reference(6000, 0x5a5a);
    let read0 = scrambled_reference(READ_LEN, 0x61);
    let block1 = scrambled_reference(READ_LEN, 0x62);
    let mut damaged = read0.clone();
    damaged[24] = if damaged[24] == b'G' { b'T' } else { b'G' };
    plant(&mut reference, 1000, &damaged);
    plant(&mut reference, 1350, &block1);
    plant(&mut reference, 3000, &read0);
    plant(&mut reference, 3350, &block1);
    let read1 = revcomp(&block1);
    let genome = TinyGenome::new(reference);
    let options = PairOpt {
        cluster_ed_compensation: 2,
        unclustered_penalty: 0.5,
        ..opt()
    };

    for cluster_support in [true, false] {
        let cluster = ClusterCounters::new(6000);
        if cluster_support {
            cluster.increment(1000);
            cluster.increment(1000);
        }
        let mut aligner = aligner(&genome, options.clone(), &cluster);

        assert!(!aligner.align_phase_1(&read0, &read1));
        assert!(aligner.align_phase_2_init());
        assert!(!aligner
            .align_phase_2_to_target_loc(0, ClusterTag::Cluster(3))
            .unwrap());

        let mut best = linked_align::results::UNSET_SCORE;
        aligner.align_phase_3_score(&mut best, false).unwrap();
        let changed = aligner
            .align_phase_3_correct_best_score(&mut best, 2)
            .unwrap();
        assert!(changed);

        let mut secondary = Vec::new();
        let mut best_result = aligner
            .align_phase_3_generate_results(2, 4, &mut best, &mut secondary)
            .unwrap();
        aligner.align_phase_4(&mut best_result, &mut secondary, 10, 0);

        if cluster_support {
            assert_eq!(best_result.location, [1000, 1350]);
        } else {
            assert_eq!(best_result.location, [3000, 3350]);
        }
    }
}

#[test]
fn secondary_buffer_grows_and_replays() {
    // Twenty-one interchangeable placements with a buffer sized for five:
    // count_results demands growth, then the replay fills all twenty
    // secondaries.
    let mut reference = scrambled_reference(102_000, 0x31);
    let block0 = scrambled_reference(READ_LEN, 0x71);
    let block1 = scrambled_reference(READ_LEN, 0x72);
    for k in 0..21usize {
        plant(&mut reference, 100 + 5000 * k, &block0);
        plant(&mut reference, 450 + 5000 * k, &block1);
    }
    let read1 = revcomp(&block1);
    let genome = TinyGenome::new(reference);
    let cluster = ClusterCounters::new(102_000);
    let mut aligner = aligner(&genome, opt(), &cluster);

    assert!(!aligner.align_phase_1(&block0, &read1));
    assert!(aligner.align_phase_2_init());
    aligner.align_phase_2().unwrap();
    let mut best = linked_align::results::UNSET_SCORE;
    aligner.align_phase_3_score(&mut best, false).unwrap();

    let mut n_secondary = 0;
    let mut probability_of_all_pairs = 0.0;
    let mut buffer_size = 5;
    while aligner
        .align_phase_3_count_results(
            2,
            &mut best,
            1,
            &mut n_secondary,
            buffer_size,
            &mut probability_of_all_pairs,
        )
        .unwrap()
    {
        buffer_size *= 2;
    }
    assert_eq!(n_secondary, 20);
    assert!(buffer_size >= 20);
    assert!(probability_of_all_pairs > 0.0);

    let mut secondary = Vec::with_capacity(buffer_size);
    let mut best_result = aligner
        .align_phase_3_generate_results(1, 2, &mut best, &mut secondary)
        .unwrap();
    assert_eq!(secondary.len(), 20);
    aligner.align_phase_4(&mut best_result, &mut secondary, 20, 0);
    assert_eq!(secondary.len(), 20);
    assert_eq!(best_result.mapq[0], 0, "21-way ambiguity leaves no confidence");
    check_invariants(&best_result, &secondary, &opt());
}

#[test]
fn realignment_with_unchanged_cluster_state_is_idempotent() {
    let mut reference = scrambled_reference(101_000, 0x1234);
    let block0 = scrambled_reference(READ_LEN, 0x51);
    let block1 = scrambled_reference(READ_LEN, 0x52);
    plant(&mut reference, 100, &block0);
    plant(&mut reference, 450, &block1);
    plant(&mut reference, 100_000, &block0);
    plant(&mut reference, 100_350, &block1);
    let read1 = revcomp(&block1);
    let genome = TinyGenome::new(reference);
    let cluster = ClusterCounters::new(101_000);
    let mut aligner = aligner(&genome, opt(), &cluster);

    let mut first_secondary = Vec::new();
    let first = aligner
        .align(&block0, &read1, 2, 2, 10, &mut first_secondary)
        .unwrap();
    let mut second_secondary = Vec::new();
    let second = aligner
        .align(&block0, &read1, 2, 2, 10, &mut second_secondary)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first_secondary, second_secondary);
}
