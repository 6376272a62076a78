//! Elastic pool sizing and per-type share computation.

use ctxforge_core::budget::{BudgetPolicy, RATIO_EPSILON};
use ctxforge_core::segment::SegmentType;
use std::collections::BTreeMap;

/// Size of the elastic pool.
///
/// `available − Σ rigid − (pinned tokens not covered by their type's rigid
/// reservation)`, floored at zero.
pub fn elastic_pool(policy: &BudgetPolicy, pinned: &BTreeMap<SegmentType, usize>) -> usize {
    let uncovered: usize = pinned
        .iter()
        .map(|(t, tokens)| tokens.saturating_sub(policy.rigid_for(*t)))
        .sum();
    policy
        .available_tokens()
        .saturating_sub(policy.rigid_total())
        .saturating_sub(uncovered)
}

/// Split the pool between types with a positive ratio.
///
/// Each type gets `floor(ratio × pool)`. The rounding remainder, up to
/// `floor(Σ ratio × pool)` (the whole pool when ratios sum to 1), goes to the
/// type with the largest ratio; ties go to the earlier type in canonical
/// order.
pub fn elastic_shares(policy: &BudgetPolicy, pool: usize) -> BTreeMap<SegmentType, usize> {
    let mut shares = BTreeMap::new();
    let mut largest: Option<(SegmentType, f64)> = None;
    let mut ratio_sum = 0.0;

    for segment_type in SegmentType::ALL {
        let ratio = policy.ratio_for(segment_type);
        if ratio <= 0.0 {
            continue;
        }
        ratio_sum += ratio;
        shares.insert(segment_type, floor_tokens(ratio * pool as f64));
        if largest.is_none_or(|(_, best)| ratio > best) {
            largest = Some((segment_type, ratio));
        }
    }

    let target = if ratio_sum >= 1.0 - RATIO_EPSILON {
        pool
    } else {
        floor_tokens(ratio_sum * pool as f64).min(pool)
    };
    let assigned: usize = shares.values().sum();
    if let Some((segment_type, _)) = largest {
        let remainder = target.saturating_sub(assigned);
        if remainder > 0 {
            *shares.entry(segment_type).or_insert(0) += remainder;
        }
    }
    shares
}

fn floor_tokens(value: f64) -> usize {
    (value + RATIO_EPSILON).floor().max(0.0) as usize
}
