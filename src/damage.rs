//! Damage tracking: the set of byte ranges known or suspected to have
//! changed since the last synchronization.
//!
//! Grounded on the teacher's preference for a small closed enum over a
//! trait object where the state space is this bounded (compare
//! `transport/shm/policy.rs::TransportSelection`): damage is either "every
//! byte" or a list of extended intervals, never something more general.

/// An arithmetic-progression run of byte ranges: `rep` repetitions of a
/// `width`-byte window, `stride` bytes apart, starting at `start`.
///
/// A plain contiguous range is the `rep == 1` case. Invariant: describes
/// the half-open union `⋃_{k=0}^{rep-1} [start + k·stride, start + k·stride + width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtInterval {
    pub start: usize,
    pub width: usize,
    pub stride: usize,
    pub rep: usize,
}

impl ExtInterval {
    pub fn new(start: usize, width: usize, stride: usize, rep: usize) -> Self {
        Self { start, width, stride, rep }
    }

    /// A single contiguous `[start, start+width)` range.
    pub fn contiguous(start: usize, width: usize) -> Self {
        Self { start, width, stride: width.max(1), rep: 1 }
    }

    /// The minimal half-open range covering every repetition.
    pub fn bounds(&self) -> Option<(usize, usize)> {
        if self.rep == 0 || self.width == 0 {
            return None;
        }
        let last_rep_start = self.start + (self.rep - 1) * self.stride;
        Some((self.start, last_rep_start + self.width))
    }

    /// Total number of damaged bytes described (sum of repetition widths,
    /// double-counting overlaps between repetitions if `stride < width`).
    pub fn area(&self) -> usize {
        self.width * self.rep
    }
}

/// Damage accumulated on a shadow fd since the last `reset`.
#[derive(Debug, Clone)]
pub enum DamageRegion {
    /// Every byte of the buffer may have changed. The coarsest, cheapest to
    /// represent, and the correct starting state for a freshly translated
    /// fd (it has no prior mirror to diff against).
    Everything,
    /// A concrete list of extended intervals. Coalescing adjacent/overlapping
    /// entries is permitted but not required by callers of `add`.
    Intervals(Vec<ExtInterval>),
}

impl Default for DamageRegion {
    fn default() -> Self {
        DamageRegion::Intervals(Vec::new())
    }
}

impl DamageRegion {
    pub fn damage_everything(&mut self) {
        *self = DamageRegion::Everything;
    }

    pub fn add(&mut self, interval: ExtInterval) {
        if let DamageRegion::Intervals(v) = self {
            v.push(interval);
        }
        // Already Everything: adding more damage can't grow past "all of it".
    }

    pub fn reset(&mut self) {
        *self = DamageRegion::Intervals(Vec::new());
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DamageRegion::Intervals(v) if v.is_empty())
    }

    /// The minimal `[lo, hi)` range covering all damage, plus the sum of
    /// repetition widths as an inexpensive cost estimate. `full_size` bounds
    /// the answer for the `Everything` sentinel, which has no size of its
    /// own. Returns `None` if there is no damage at all.
    pub fn get_damage_interval(&self, full_size: usize) -> Option<(usize, usize, usize)> {
        match self {
            DamageRegion::Everything => {
                if full_size == 0 {
                    None
                } else {
                    Some((0, full_size, full_size))
                }
            }
            DamageRegion::Intervals(v) => {
                if v.is_empty() {
                    return None;
                }
                let mut lo = usize::MAX;
                let mut hi = 0usize;
                let mut area = 0usize;
                for iv in v {
                    if let Some((b_lo, b_hi)) = iv.bounds() {
                        lo = lo.min(b_lo);
                        hi = hi.max(b_hi);
                        area += iv.area();
                    }
                }
                if hi <= lo {
                    None
                } else {
                    Some((lo, hi, area))
                }
            }
        }
    }

    /// Expand into a sorted, merged list of non-overlapping byte ranges
    /// intersected with `[0, full_size)`. Used by `construct_diff` to walk
    /// exactly the bytes that might differ.
    pub(crate) fn to_merged_ranges(&self, full_size: usize) -> Vec<(usize, usize)> {
        let mut ranges: Vec<(usize, usize)> = match self {
            DamageRegion::Everything => {
                if full_size == 0 {
                    return Vec::new();
                }
                return vec![(0, full_size)];
            }
            DamageRegion::Intervals(v) => v
                .iter()
                .filter_map(|iv| iv.bounds())
                .map(|(lo, hi)| (lo.min(full_size), hi.min(full_size)))
                .filter(|(lo, hi)| lo < hi)
                .collect(),
        };
        if ranges.is_empty() {
            return ranges;
        }
        ranges.sort_unstable_by_key(|r| r.0);
        let mut merged = Vec::with_capacity(ranges.len());
        let mut cur = ranges[0];
        for &(lo, hi) in &ranges[1..] {
            if lo <= cur.1 {
                cur.1 = cur.1.max(hi);
            } else {
                merged.push(cur);
                cur = (lo, hi);
            }
        }
        merged.push(cur);
        merged
    }
}
