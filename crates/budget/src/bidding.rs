//! Cross-type bidding for unused elastic headroom.
//!
//! Segments that missed their own type's share may bid for whatever other
//! types left unused, but only when they outrank the median of what was
//! already admitted. Bids are resolved strictly in (priority desc, ordinal
//! asc) order; a bid wins iff the remaining headroom covers it entirely.

use ctxforge_core::segment::SegmentType;
use std::collections::BTreeMap;

/// Median priority of admitted segments, `None` when nothing was admitted.
///
/// Even-sized sets average the two middle values.
pub fn median_priority(priorities: &[i64]) -> Option<f64> {
    if priorities.is_empty() {
        return None;
    }
    let mut sorted = priorities.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    })
}

/// Whether a segment of `priority` may bid given the admitted median.
pub fn may_bid(priority: i64, median: Option<f64>) -> bool {
    median.is_none_or(|m| priority as f64 > m)
}

/// Unused elastic headroom, tracked per donor type.
#[derive(Debug, Clone, Default)]
pub struct Headroom {
    by_type: BTreeMap<SegmentType, usize>,
}

impl Headroom {
    pub fn new(by_type: BTreeMap<SegmentType, usize>) -> Self {
        Self { by_type }
    }

    pub fn total(&self) -> usize {
        self.by_type.values().sum()
    }

    /// Take `tokens` from donors in canonical type order.
    ///
    /// Returns the donors and amounts on success; takes nothing and returns
    /// `None` when the total headroom is insufficient.
    pub fn claim(&mut self, tokens: usize) -> Option<Vec<(SegmentType, usize)>> {
        if tokens > self.total() {
            return None;
        }
        let mut needed = tokens;
        let mut donors = Vec::new();
        for (segment_type, free) in self.by_type.iter_mut() {
            if needed == 0 {
                break;
            }
            let take = needed.min(*free);
            if take > 0 {
                *free -= take;
                needed -= take;
                donors.push((*segment_type, take));
            }
        }
        Some(donors)
    }
}

/// Render donors for an audit detail, e.g. `messages:30, state:5`.
pub fn describe_donors(donors: &[(SegmentType, usize)]) -> String {
    if donors.is_empty() {
        return "none".into();
    }
    donors
        .iter()
        .map(|(t, n)| format!("{t}:{n}"))
        .collect::<Vec<_>>()
        .join(", ")
}
