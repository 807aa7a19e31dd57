// Error types for the alignment core.
//
// Only genuinely fatal conditions are errors: the scratch pools are sized to
// upper bounds at construction, so running one dry means the aligner was
// misconfigured for its inputs. Unmappable pairs and too-small secondary
// buffers are ordinary return values, not errors.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlignError {
    /// The scoring-candidate pool ran dry while materializing fewer-hits
    /// placements.
    #[error("scoring candidate pool exhausted (capacity {capacity})")]
    CandidatePoolExhausted { capacity: usize },

    /// The mate-candidate pool for one set pair ran dry.
    #[error("mate candidate pool exhausted for set pair {set_pair} (capacity {capacity})")]
    MateCandidatePoolExhausted { set_pair: usize, capacity: usize },

    /// The merge-anchor pool ran dry while deduplicating near-identical
    /// placements.
    #[error("merge anchor pool exhausted (capacity {capacity})")]
    MergeAnchorPoolExhausted { capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_capacity() {
        let e = AlignError::MateCandidatePoolExhausted {
            set_pair: 1,
            capacity: 64,
        };
        assert_eq!(
            e.to_string(),
            "mate candidate pool exhausted for set pair 1 (capacity 64)"
        );
    }
}
