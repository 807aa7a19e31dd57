// Seed hit sets: the union of hash-table lookups for one (read, direction).
//
// Each lookup is a cursor over one seed's sorted (descending) hit list. The
// set supports a single downward pass per init(): getFirstHit /
// getNextLowerHit walk one step at a time, and getNextHitLessThanOrEqualTo
// jumps via binary search. Because different seeds sit at different offsets
// within the read, every comparison happens in read-start space: a hit h for
// a seed at offset o places the read at h - o, so a bound L translates to a
// per-lookup target of L + o.
//
// Lookups that still have hits at or below the pass position live in a
// circular doubly-linked list threaded through the lookup arena by index.
// There is no sentinel head; emptiness is discovered at removal time, which
// keeps a hard-to-predict head comparison out of the hot loop. A second
// linked list threads the lookups whose binary search is still running, so
// the searches advance in lock step, one probe per lookup per round, with a
// cache prefetch issued for the next probe of each.
//
// Seeds whose read positions do not overlap are grouped into a disjoint hit
// set: each member that misses a locus proves at least one edit inside its
// own span of the read, and because the spans are disjoint the edits are
// distinct. The minimum miss count over the groups is therefore a lower
// bound on the edit distance at the current locus.

use crate::genome::{locations_within, GenomeLocation, HitSlice};

const NO_LOOKUP: u32 = u32::MAX;

#[derive(Debug, Default, Clone, Copy)]
struct DisjointHitSet {
    count_of_exhausted_hits: u32,
    miss_count: u32,
}

#[derive(Debug)]
struct HashTableLookup<'a> {
    seed_offset: u32,
    hits: HitSlice<'a>,
    which_disjoint_hit_set: u32,

    /// Index of the next unexamined hit; only ever increases.
    current_hit: usize,

    // Circular list of lookups with remaining members.
    next_remaining: u32,
    prev_remaining: u32,

    // Binary-search scratch. This would ordinarily be stack state inside the
    // search routine, but interleaving the searches means every lookup needs
    // its own copy, so it lives here.
    lo: usize,
    hi: usize,
    search_target: GenomeLocation,

    // Circular list of lookups whose current binary search has not finished.
    next_search: u32,
    prev_search: u32,
}

impl HashTableLookup<'_> {
    /// Read-start location of the hit at `i`.
    #[inline]
    fn adjusted(&self, i: usize) -> GenomeLocation {
        self.hits.get(i).saturating_sub(self.seed_offset as u64)
    }
}

pub struct HashTableHitSet<'a> {
    lookups: Vec<HashTableLookup<'a>>,
    disjoint_hit_sets: Vec<DisjointHitSet>,
    remaining_head: u32,
    n_remaining: u32,
    most_recent_location_returned: GenomeLocation,
    max_merge_distance: u64,
}

impl<'a> HashTableHitSet<'a> {
    pub fn new(max_seeds: usize, max_merge_distance: u64) -> HashTableHitSet<'a> {
        HashTableHitSet {
            lookups: Vec::with_capacity(max_seeds),
            disjoint_hit_sets: Vec::with_capacity(max_seeds),
            remaining_head: NO_LOOKUP,
            n_remaining: 0,
            most_recent_location_returned: GenomeLocation::MAX,
            max_merge_distance,
        }
    }

    /// Reset to the empty state, keeping allocations.
    pub fn init(&mut self) {
        self.lookups.clear();
        self.disjoint_hit_sets.clear();
        self.remaining_head = NO_LOOKUP;
        self.n_remaining = 0;
        self.most_recent_location_returned = GenomeLocation::MAX;
    }

    /// Number of lookups with a non-empty hit list.
    pub fn n_lookups(&self) -> usize {
        self.lookups.len()
    }

    /// Sum of remaining hit-list lengths, used for the fewer/more split.
    pub fn total_hits(&self) -> i64 {
        self.lookups.iter().map(|l| l.hits.len() as i64).sum()
    }

    /// Record one hash-table lookup. All recording must happen before the
    /// iteration starts. An empty hit list is not iterable but still proves a
    /// miss everywhere, so it immediately raises its disjoint set's exhausted
    /// count.
    pub fn record_lookup(
        &mut self,
        seed_offset: u32,
        hits: HitSlice<'a>,
        begins_disjoint_hit_set: bool,
    ) {
        if begins_disjoint_hit_set || self.disjoint_hit_sets.is_empty() {
            self.disjoint_hit_sets.push(DisjointHitSet::default());
        }
        let which_disjoint_hit_set = (self.disjoint_hit_sets.len() - 1) as u32;

        if hits.is_empty() {
            self.disjoint_hit_sets[which_disjoint_hit_set as usize].count_of_exhausted_hits += 1;
            return;
        }

        let idx = self.lookups.len() as u32;
        let (next_remaining, prev_remaining) = if self.remaining_head == NO_LOOKUP {
            self.remaining_head = idx;
            (idx, idx)
        } else {
            // Insert just before the head.
            let head = self.remaining_head;
            let tail = self.lookups[head as usize].prev_remaining;
            self.lookups[head as usize].prev_remaining = idx;
            self.lookups[tail as usize].next_remaining = idx;
            (head, tail)
        };
        self.n_remaining += 1;

        self.lookups.push(HashTableLookup {
            seed_offset,
            hits,
            which_disjoint_hit_set,
            current_hit: 0,
            next_remaining,
            prev_remaining,
            lo: 0,
            hi: 0,
            search_target: 0,
            next_search: NO_LOOKUP,
            prev_search: NO_LOOKUP,
        });
    }

    fn remove_remaining(&mut self, idx: u32) {
        let next = self.lookups[idx as usize].next_remaining;
        let prev = self.lookups[idx as usize].prev_remaining;
        if next == idx {
            // Last member; the list is only discovered empty here.
            self.remaining_head = NO_LOOKUP;
        } else {
            self.lookups[prev as usize].next_remaining = next;
            self.lookups[next as usize].prev_remaining = prev;
            if self.remaining_head == idx {
                self.remaining_head = next;
            }
        }
        self.n_remaining -= 1;
        let ds = self.lookups[idx as usize].which_disjoint_hit_set as usize;
        self.disjoint_hit_sets[ds].count_of_exhausted_hits += 1;
    }

    /// Highest read-start location over all member lookups. Non-consuming;
    /// the walk proper starts with `get_next_lower_hit`.
    pub fn get_first_hit(&mut self) -> Option<(GenomeLocation, u32)> {
        if self.remaining_head == NO_LOOKUP {
            return None;
        }
        let mut best: Option<(GenomeLocation, u32)> = None;
        let mut i = self.remaining_head;
        for _ in 0..self.n_remaining {
            let l = &self.lookups[i as usize];
            let loc = l.adjusted(l.current_hit);
            if best.map_or(true, |(b, _)| loc > b) {
                best = Some((loc, l.seed_offset));
            }
            i = l.next_remaining;
        }
        if let Some((loc, _)) = best {
            self.most_recent_location_returned = loc;
        }
        best
    }

    /// Walk down one step without binary searching: consume every member
    /// sitting at the most recently returned location, then return the next
    /// highest remaining one.
    pub fn get_next_lower_hit(&mut self) -> Option<(GenomeLocation, u32)> {
        if self.remaining_head == NO_LOOKUP {
            return None;
        }
        let floor = self.most_recent_location_returned;

        // Consume hits at the current location; capture next links before any
        // removal so the snapshot walk stays valid.
        let mut i = self.remaining_head;
        let n = self.n_remaining;
        for _ in 0..n {
            let next = self.lookups[i as usize].next_remaining;
            {
                let l = &mut self.lookups[i as usize];
                while l.current_hit < l.hits.len() && l.adjusted(l.current_hit) >= floor {
                    l.current_hit += 1;
                }
            }
            if self.lookups[i as usize].current_hit >= self.lookups[i as usize].hits.len() {
                self.remove_remaining(i);
            }
            i = next;
        }

        if self.remaining_head == NO_LOOKUP {
            return None;
        }
        let mut best: Option<(GenomeLocation, u32)> = None;
        let mut i = self.remaining_head;
        for _ in 0..self.n_remaining {
            let l = &self.lookups[i as usize];
            let loc = l.adjusted(l.current_hit);
            if best.map_or(true, |(b, _)| loc > b) {
                best = Some((loc, l.seed_offset));
            }
            i = l.next_remaining;
        }
        if let Some((loc, _)) = best {
            self.most_recent_location_returned = loc;
        }
        best
    }

    /// Highest remaining read-start location `<= bound`, and the seed offset
    /// that produced it. `bound` must be strictly below the previously
    /// returned location; a set only supports one downward pass per init().
    ///
    /// All member searches run interleaved: one probe per lookup per round,
    /// each round prefetching the next probe, so the memory latency of the
    /// very long hit lists overlaps instead of serializing.
    pub fn get_next_hit_less_than_or_equal_to(
        &mut self,
        bound: GenomeLocation,
    ) -> Option<(GenomeLocation, u32)> {
        debug_assert!(bound < self.most_recent_location_returned);
        if self.remaining_head == NO_LOOKUP {
            return None;
        }

        // Seed each member's search over its unconsumed tail and thread the
        // search list.
        let mut search_head = NO_LOOKUP;
        let mut n_active: u32 = 0;
        {
            let mut i = self.remaining_head;
            for _ in 0..self.n_remaining {
                let next = self.lookups[i as usize].next_remaining;
                let l = &mut self.lookups[i as usize];
                l.search_target = bound.saturating_add(l.seed_offset as u64);
                l.lo = l.current_hit;
                l.hi = l.hits.len();
                l.hits.prefetch((l.lo + l.hi) / 2);
                if search_head == NO_LOOKUP {
                    l.next_search = i;
                    l.prev_search = i;
                    search_head = i;
                } else {
                    let head = search_head;
                    let tail = self.lookups[head as usize].prev_search;
                    self.lookups[i as usize].next_search = head;
                    self.lookups[i as usize].prev_search = tail;
                    self.lookups[head as usize].prev_search = i;
                    self.lookups[tail as usize].next_search = i;
                }
                n_active += 1;
                i = next;
            }
        }

        let mut best: Option<(GenomeLocation, u32)> = None;

        // Drive every active search one probe per round.
        while n_active > 0 {
            let mut i = search_head;
            let round = n_active;
            for _ in 0..round {
                let next = self.lookups[i as usize].next_search;
                {
                    let l = &mut self.lookups[i as usize];
                    if l.lo < l.hi {
                        let mid = (l.lo + l.hi) / 2;
                        if l.hits.get(mid) > l.search_target {
                            l.lo = mid + 1;
                        } else {
                            l.hi = mid;
                        }
                        if l.lo < l.hi {
                            l.hits.prefetch((l.lo + l.hi) / 2);
                        }
                    }
                }
                if self.lookups[i as usize].lo >= self.lookups[i as usize].hi {
                    // Search finished: unlink from the search list.
                    let n = self.lookups[i as usize].next_search;
                    let p = self.lookups[i as usize].prev_search;
                    if n == i {
                        search_head = NO_LOOKUP;
                    } else {
                        self.lookups[p as usize].next_search = n;
                        self.lookups[n as usize].prev_search = p;
                        if search_head == i {
                            search_head = n;
                        }
                    }
                    n_active -= 1;

                    let pos = self.lookups[i as usize].lo;
                    if pos >= self.lookups[i as usize].hits.len() {
                        // Every remaining hit is above the bound; this seed is
                        // done for the rest of the pass.
                        self.remove_remaining(i);
                    } else {
                        let l = &mut self.lookups[i as usize];
                        l.current_hit = pos;
                        let loc = l.adjusted(pos);
                        let seed_offset = l.seed_offset;
                        if best.map_or(true, |(b, _)| loc > b) {
                            best = Some((loc, seed_offset));
                        }
                    }
                }
                i = next;
            }
        }

        if let Some((loc, _)) = best {
            self.most_recent_location_returned = loc;
        }
        best
    }

    /// Provable edit-distance lower bound at the most recently returned
    /// location: the minimum, over disjoint hit sets, of the number of member
    /// seeds that do not hit near it.
    pub fn compute_best_possible_score_for_current_hit(&mut self) -> u32 {
        for ds in &mut self.disjoint_hit_sets {
            ds.miss_count = ds.count_of_exhausted_hits;
        }
        let here = self.most_recent_location_returned;
        if self.remaining_head != NO_LOOKUP {
            let mut i = self.remaining_head;
            for _ in 0..self.n_remaining {
                let l = &self.lookups[i as usize];
                // The matching hit may be the current one, or the one the
                // cursor just stepped past.
                let near = (l.current_hit < l.hits.len()
                    && locations_within(l.adjusted(l.current_hit), here, self.max_merge_distance))
                    || (l.current_hit > 0
                        && locations_within(
                            l.adjusted(l.current_hit - 1),
                            here,
                            self.max_merge_distance,
                        ));
                if !near {
                    self.disjoint_hit_sets[l.which_disjoint_hit_set as usize].miss_count += 1;
                }
                i = self.lookups[i as usize].next_remaining;
            }
        }
        self.disjoint_hit_sets
            .iter()
            .map(|ds| ds.miss_count)
            .min()
            .unwrap_or(0)
    }
}
