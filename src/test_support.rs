// Shared toy fixtures for unit tests: a hash-table index over a small
// in-memory reference, and a plain DP scorer standing in for the external
// Landau-Vishkin engines.

use std::collections::HashMap;

use bio::alphabets::dna;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::edit_distance::{EditDistanceScorer, ScoredAlignment};
use crate::genome::{GenomeIndex, GenomeLocation, HitSlice, SeedHits};

const EMPTY_WIDE: &[u64] = &[];
const EMPTY_NARROW: &[u32] = &[];

pub(crate) struct ToyIndex {
    reference: Vec<u8>,
    seed_len: usize,
    wide: HashMap<Vec<u8>, Vec<u64>>,
    narrow: HashMap<Vec<u8>, Vec<u32>>,
    use_narrow: bool,
    contig_starts: Vec<u64>,
}

impl ToyIndex {
    pub fn build(reference: Vec<u8>, seed_len: usize) -> ToyIndex {
        ToyIndex::with_contigs(reference, seed_len, vec![0])
    }

    /// `contig_starts` must be ascending and begin with 0.
    pub fn with_contigs(
        reference: Vec<u8>,
        seed_len: usize,
        contig_starts: Vec<u64>,
    ) -> ToyIndex {
        assert_eq!(contig_starts.first(), Some(&0));
        let mut wide: HashMap<Vec<u8>, Vec<u64>> = HashMap::new();
        if reference.len() >= seed_len {
            for i in 0..=reference.len() - seed_len {
                wide.entry(reference[i..i + seed_len].to_vec())
                    .or_default()
                    .push(i as u64);
            }
        }
        for hits in wide.values_mut() {
            hits.sort_unstable_by(|a, b| b.cmp(a));
        }
        let narrow = wide
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().map(|&h| h as u32).collect()))
            .collect();
        ToyIndex {
            reference,
            seed_len,
            wide,
            narrow,
            use_narrow: false,
            contig_starts,
        }
    }

    /// Serve hits as 32-bit locations instead of 64-bit.
    pub fn narrow(mut self) -> ToyIndex {
        self.use_narrow = true;
        self
    }

    fn hits_for(&self, seed: &[u8]) -> HitSlice<'_> {
        if self.use_narrow {
            match self.narrow.get(seed) {
                Some(hits) => HitSlice::Narrow(hits),
                None => HitSlice::Narrow(EMPTY_NARROW),
            }
        } else {
            match self.wide.get(seed) {
                Some(hits) => HitSlice::Wide(hits),
                None => HitSlice::Wide(EMPTY_WIDE),
            }
        }
    }
}

impl GenomeIndex for ToyIndex {
    fn seed_len(&self) -> usize {
        self.seed_len
    }

    fn genome_len(&self) -> GenomeLocation {
        self.reference.len() as GenomeLocation
    }

    fn lookup(&self, seed: &[u8]) -> SeedHits<'_> {
        let rc = dna::revcomp(seed);
        SeedHits {
            forward: self.hits_for(seed),
            reverse_complement: self.hits_for(&rc),
        }
    }

    fn contig_count(&self) -> usize {
        self.contig_starts.len()
    }

    fn contig_of(&self, location: GenomeLocation) -> usize {
        self.contig_starts.partition_point(|&s| s <= location) - 1
    }

    fn reference_slice(&self, location: GenomeLocation, len: usize) -> &[u8] {
        let start = (location as usize).min(self.reference.len());
        let end = (start + len).min(self.reference.len());
        &self.reference[start..end]
    }
}

/// Full-matrix edit distance with a free text tail, anchored at the start of
/// the text (or the end, for the reverse instance). Slow but obviously
/// correct, which is what a test double should be.
pub(crate) struct BandedEditDistance {
    reversed: bool,
}

impl BandedEditDistance {
    pub fn forward() -> Box<dyn EditDistanceScorer> {
        Box::new(BandedEditDistance { reversed: false })
    }

    pub fn reverse() -> Box<dyn EditDistanceScorer> {
        Box::new(BandedEditDistance { reversed: true })
    }
}

impl EditDistanceScorer for BandedEditDistance {
    fn score(&mut self, pattern: &[u8], text: &[u8], score_limit: u32) -> Option<ScoredAlignment> {
        let (pattern, text): (Vec<u8>, Vec<u8>) = if self.reversed {
            (
                pattern.iter().rev().copied().collect(),
                text.iter().rev().copied().collect(),
            )
        } else {
            (pattern.to_vec(), text.to_vec())
        };
        let m = pattern.len();
        let n = text.len();
        if m == 0 {
            return Some(ScoredAlignment {
                score: 0,
                match_probability: 1.0,
                location_offset: 0,
            });
        }

        let mut prev: Vec<u32> = (0..=n as u32).collect();
        let mut curr: Vec<u32> = vec![0; n + 1];
        for i in 1..=m {
            curr[0] = i as u32;
            for j in 1..=n {
                let sub = prev[j - 1] + u32::from(pattern[i - 1] != text[j - 1]);
                curr[j] = sub.min(prev[j] + 1).min(curr[j - 1] + 1);
            }
            std::mem::swap(&mut prev, &mut curr);
        }
        let score = *prev.iter().min().expect("non-empty DP row");
        if score > score_limit {
            return None;
        }
        let matched = (m as u32).saturating_sub(score);
        Some(ScoredAlignment {
            score,
            match_probability: 0.999f64.powi(matched as i32) * 0.001f64.powi(score as i32),
            location_offset: 0,
        })
    }
}

pub(crate) fn random_reference(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
}

pub(crate) fn revcomp(seq: &[u8]) -> Vec<u8> {
    dna::revcomp(seq)
}

pub(crate) fn plant(reference: &mut [u8], pos: usize, block: &[u8]) {
    reference[pos..pos + block.len()].copy_from_slice(block);
}
