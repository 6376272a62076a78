//! The budget engine — decides which ranked segments fit the token window.
//!
//! Phases, in order:
//!
//! 1. **Pinning**: must_keep segments are admitted before anything else.
//! 2. **Rigid**: fixed per-type reservations, first-fit in ranked order.
//! 3. **Elastic**: ratio shares of the remaining pool, first-fit per type.
//! 4. **Bidding**: high-priority misses compete for unused shares.
//! 5. **Must-keep protection**: evict low-priority segments if pinning
//!    pushed usage past the window.
//! 6. **Overflow**: truncate, compress, or fail on whatever is left.
//!
//! # Determinism
//!
//! Every phase walks segments in ranked order (priority desc, ordinal asc)
//! and every type-level tie goes to canonical type order. No clock or
//! random state is consulted, so identical input yields identical
//! decisions.

use crate::bidding::{self, Headroom};
use crate::shares;
use ctxforge_core::audit::{ReasonCode, StageJournal};
use ctxforge_core::budget::{
    BudgetAllocation, BudgetPolicy, OverflowStrategy, RigidOverflow, TypeAllocation, saturation,
};
use ctxforge_core::compress::Compressor;
use ctxforge_core::error::{BudgetError, CompressError, StageError};
use ctxforge_core::segment::{Segment, SegmentId, SegmentType, rank_order};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ── Types ─────────────────────────────────────────────────────────────────

/// Where a segment currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Not yet considered by the elastic phase.
    Unplaced,
    Pinned,
    Rigid,
    Elastic,
    Bid,
    /// Admitted while resolving overflow by compression.
    Overflow,
    /// Not admitted; the reason is kept for the final decision.
    Pending(ReasonCode),
    Dropped(ReasonCode),
}

impl Slot {
    fn is_admitted(self) -> bool {
        matches!(
            self,
            Slot::Pinned | Slot::Rigid | Slot::Elastic | Slot::Bid | Slot::Overflow
        )
    }
}

struct Candidate {
    segment: Segment,
    slot: Slot,
    /// Token count before this engine compressed the segment.
    compressed_from: Option<usize>,
    detail: String,
}

impl Candidate {
    fn tokens(&self) -> usize {
        self.segment.token_count()
    }

    fn place(&mut self, slot: Slot, detail: impl Into<String>) {
        self.slot = slot;
        self.detail = detail.into();
    }
}

/// Result of a successful allocation.
#[derive(Debug)]
pub struct Allocated {
    /// Admitted segments in ranked order.
    pub segments: Vec<Segment>,
    /// Allocation summary (also stored in the journal).
    pub allocation: BudgetAllocation,
    /// One decision per input segment, in ranked order, plus warnings.
    pub journal: StageJournal,
}

// ── Engine ────────────────────────────────────────────────────────────────

/// Token-budget allocation engine. Holds no per-build state.
pub struct BudgetEngine {
    policy: BudgetPolicy,
    compressor: Option<Arc<dyn Compressor>>,
}

impl BudgetEngine {
    pub fn new(policy: BudgetPolicy) -> Self {
        Self {
            policy,
            compressor: None,
        }
    }

    /// Compressor used by the `compress` overflow strategy.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    /// Allocate the window among `segments`.
    ///
    /// `already_compressed` names segments that used their one compression
    /// pass earlier in the build; they are never compressed again.
    pub async fn allocate(
        &self,
        segments: Vec<Segment>,
        already_compressed: &BTreeSet<SegmentId>,
    ) -> Result<Allocated, StageError> {
        let policy = &self.policy;
        let available = policy.available_tokens();

        let mut ranked = segments;
        ranked.sort_by(rank_order);
        let mut run = Run::new(ranked);
        let mut journal = StageJournal::new();

        run.pin(available)?;
        run.fill_rigid(policy);

        let pinned = run.pinned_by_type();
        let pool = shares::elastic_pool(policy, &pinned);
        let shares = shares::elastic_shares(policy, pool);
        let mut headroom = run.fill_elastic(&shares);
        run.bid(&mut headroom);
        let headroom_unused = headroom.total();

        run.protect_must_keep(available);

        match policy.overflow_strategy {
            OverflowStrategy::TruncateLowestPriority => run.drop_pending(),
            OverflowStrategy::Error => {
                let unadmitted = run.pending();
                if !unadmitted.is_empty() {
                    return Err(BudgetError::Overflow {
                        requested: unadmitted.iter().map(|&i| run.candidates[i].tokens()).sum(),
                        segment_ids: unadmitted
                            .iter()
                            .map(|&i| run.candidates[i].segment.id().clone())
                            .collect(),
                        available,
                    }
                    .into());
                }
            }
            OverflowStrategy::Compress => match &self.compressor {
                Some(compressor) => {
                    let caps = run.type_caps(policy, &shares);
                    let mut compressed = already_compressed.clone();
                    self.resolve_by_compression(
                        &mut run,
                        compressor.as_ref(),
                        &caps,
                        &mut compressed,
                        &mut journal,
                    )
                    .await?;
                }
                None => {
                    if !run.pending().is_empty() {
                        journal.warn(
                            "overflow strategy is compress but no compressor is configured; \
                             unadmitted segments were dropped",
                        );
                    }
                    run.drop_pending();
                }
            },
        }

        let allocation = run.summarize(policy, &shares, headroom_unused);
        tracing::debug!(
            pool,
            used = allocation.tokens_used,
            available,
            dropped = allocation.dropped.len(),
            "Budget allocated"
        );
        if allocation.saturation_rate > policy.saturation_threshold {
            journal.warn(format!(
                "budget saturation {:.2} exceeds threshold {:.2}",
                allocation.saturation_rate, policy.saturation_threshold
            ));
        }

        run.record_decisions(&mut journal);
        journal.set_allocation(allocation.clone());

        Ok(Allocated {
            segments: run.into_admitted(),
            allocation,
            journal,
        })
    }

    /// Overflow strategy `compress`.
    ///
    /// For each unadmitted segment in ranked order, compress lower-priority
    /// admitted segments of the same type (lowest first) until it fits; then
    /// try compressing the segment itself once.
    async fn resolve_by_compression(
        &self,
        run: &mut Run,
        compressor: &dyn Compressor,
        caps: &BTreeMap<SegmentType, usize>,
        compressed: &mut BTreeSet<SegmentId>,
        journal: &mut StageJournal,
    ) -> Result<(), StageError> {
        let available = self.policy.available_tokens();
        let ratio = self.policy.compression_target_ratio;

        for idx in run.pending() {
            let Slot::Pending(reason) = run.candidates[idx].slot else {
                continue;
            };
            if reason == ReasonCode::RigidReservationExhausted {
                run.candidates[idx].slot = Slot::Dropped(reason);
                continue;
            }

            let segment_type = run.candidates[idx].segment.segment_type();
            let priority = run.candidates[idx].segment.priority();
            loop {
                let tokens = run.candidates[idx].tokens();
                let type_free = caps
                    .get(&segment_type)
                    .copied()
                    .unwrap_or(0)
                    .saturating_sub(run.used_by(segment_type));
                let global_free = available.saturating_sub(run.used());
                if tokens <= type_free && tokens <= global_free {
                    run.candidates[idx].place(
                        Slot::Overflow,
                        format!("admitted after compression freed {type_free} {segment_type} tokens"),
                    );
                    break;
                }

                if let Some(victim) = run.compression_victim(segment_type, priority, compressed) {
                    compress_in_place(run, victim, compressor, ratio).await?;
                    let id = run.candidates[victim].segment.id().clone();
                    journal.mark_compressed(&id);
                    compressed.insert(id);
                    continue;
                }

                let own_id = run.candidates[idx].segment.id().clone();
                if !compressed.contains(&own_id) {
                    compress_in_place(run, idx, compressor, ratio).await?;
                    journal.mark_compressed(&own_id);
                    compressed.insert(own_id);
                    continue;
                }

                run.candidates[idx].place(
                    Slot::Dropped(ReasonCode::CompressionInsufficient),
                    format!(
                        "{tokens} tokens still exceed {type_free} free {segment_type} tokens after compression"
                    ),
                );
                break;
            }
        }
        Ok(())
    }
}

/// Compress one candidate, keeping the result only when it is smaller.
async fn compress_in_place(
    run: &mut Run,
    idx: usize,
    compressor: &dyn Compressor,
    ratio: f64,
) -> Result<(), StageError> {
    let candidate = &mut run.candidates[idx];
    let before = candidate.tokens();
    let result = compressor.compress(&candidate.segment, ratio).await?;
    if result.id() != candidate.segment.id() {
        return Err(CompressError::IdentityChanged {
            compressor: compressor.name().to_string(),
            expected: candidate.segment.id().clone(),
            actual: result.id().clone(),
        }
        .into());
    }
    if !result.is_counted() {
        return Err(CompressError::Failed {
            segment_id: candidate.segment.id().clone(),
            compressor: compressor.name().to_string(),
            reason: "compressed segment carries no token count".into(),
        }
        .into());
    }
    if result.token_count() < before {
        tracing::debug!(
            segment_id = %candidate.segment.id(),
            before,
            after = result.token_count(),
            "Compressed segment to free budget"
        );
        candidate.compressed_from.get_or_insert(before);
        candidate.segment = result;
    }
    Ok(())
}

// ── Allocation run ────────────────────────────────────────────────────────

/// Mutable state of one allocation, candidates kept in ranked order.
struct Run {
    candidates: Vec<Candidate>,
}

impl Run {
    fn new(ranked: Vec<Segment>) -> Self {
        Self {
            candidates: ranked
                .into_iter()
                .map(|segment| Candidate {
                    segment,
                    slot: Slot::Unplaced,
                    compressed_from: None,
                    detail: String::new(),
                })
                .collect(),
        }
    }

    fn used(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.slot.is_admitted())
            .map(Candidate::tokens)
            .sum()
    }

    fn used_by(&self, segment_type: SegmentType) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.slot.is_admitted() && c.segment.segment_type() == segment_type)
            .map(Candidate::tokens)
            .sum()
    }

    fn pinned_by_type(&self) -> BTreeMap<SegmentType, usize> {
        let mut pinned = BTreeMap::new();
        for c in self.candidates.iter().filter(|c| c.slot == Slot::Pinned) {
            *pinned.entry(c.segment.segment_type()).or_insert(0) += c.tokens();
        }
        pinned
    }

    /// Indices of unadmitted, undropped segments in ranked order.
    fn pending(&self) -> Vec<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c.slot, Slot::Pending(_)))
            .map(|(i, _)| i)
            .collect()
    }

    fn pin(&mut self, available: usize) -> Result<(), BudgetError> {
        let required: usize = self
            .candidates
            .iter()
            .filter(|c| c.segment.must_keep())
            .map(Candidate::tokens)
            .sum();
        if required > available {
            let pinned = self.candidates.iter().filter(|c| c.segment.must_keep());
            let oversized: Vec<SegmentId> = pinned
                .clone()
                .filter(|c| c.tokens() > available)
                .map(|c| c.segment.id().clone())
                .collect();
            let segment_ids = if oversized.is_empty() {
                pinned.map(|c| c.segment.id().clone()).collect()
            } else {
                oversized
            };
            return Err(BudgetError::MustKeepExceeded {
                segment_ids,
                required,
                available,
            });
        }

        for c in self.candidates.iter_mut().filter(|c| c.segment.must_keep()) {
            let detail = format!("must_keep segment pinned ({} tokens)", c.tokens());
            c.place(Slot::Pinned, detail);
        }
        Ok(())
    }

    fn fill_rigid(&mut self, policy: &BudgetPolicy) {
        let pinned = self.pinned_by_type();
        let mut left: BTreeMap<SegmentType, usize> = policy
            .rigid_tokens
            .iter()
            .map(|(t, reserved)| {
                (*t, reserved.saturating_sub(pinned.get(t).copied().unwrap_or(0)))
            })
            .collect();

        for c in self.candidates.iter_mut().filter(|c| c.slot == Slot::Unplaced) {
            let segment_type = c.segment.segment_type();
            let Some(free) = left.get_mut(&segment_type) else {
                continue;
            };
            let tokens = c.tokens();
            if tokens <= *free {
                *free -= tokens;
                let detail = format!(
                    "admitted within {segment_type} rigid reservation of {}",
                    policy.rigid_for(segment_type)
                );
                c.place(Slot::Rigid, detail);
            } else if policy.rigid_overflow == RigidOverflow::Drop {
                let detail = format!(
                    "{tokens} tokens exceed the {free} left in the {segment_type} rigid reservation"
                );
                c.place(Slot::Pending(ReasonCode::RigidReservationExhausted), detail);
            }
        }
    }

    fn fill_elastic(&mut self, shares: &BTreeMap<SegmentType, usize>) -> Headroom {
        let mut left = shares.clone();
        for c in self.candidates.iter_mut().filter(|c| c.slot == Slot::Unplaced) {
            let segment_type = c.segment.segment_type();
            let tokens = c.tokens();
            match left.get_mut(&segment_type) {
                None => c.place(
                    Slot::Pending(ReasonCode::NoElasticShare),
                    format!("{segment_type} has no elastic ratio"),
                ),
                Some(free) if tokens <= *free => {
                    *free -= tokens;
                    let detail = format!(
                        "admitted within {segment_type} elastic share of {}",
                        shares.get(&segment_type).copied().unwrap_or(0)
                    );
                    c.place(Slot::Elastic, detail);
                }
                Some(free) => {
                    let detail = format!(
                        "{tokens} tokens exceed the {free} left in the {segment_type} elastic share"
                    );
                    c.place(Slot::Pending(ReasonCode::ElasticShareExhausted), detail);
                }
            }
        }
        Headroom::new(left)
    }

    /// Candidates are already in (priority desc, ordinal asc) order, which is
    /// the bid resolution order.
    fn bid(&mut self, headroom: &mut Headroom) {
        let admitted: Vec<i64> = self
            .candidates
            .iter()
            .filter(|c| c.slot.is_admitted())
            .map(|c| c.segment.priority())
            .collect();
        let median = bidding::median_priority(&admitted);

        for c in self.candidates.iter_mut() {
            let eligible = matches!(
                c.slot,
                Slot::Pending(ReasonCode::ElasticShareExhausted | ReasonCode::NoElasticShare)
            ) && bidding::may_bid(c.segment.priority(), median);
            if !eligible {
                continue;
            }
            let tokens = c.tokens();
            match headroom.claim(tokens) {
                Some(donors) => {
                    let detail = format!(
                        "won {tokens} tokens of unused headroom from {}",
                        bidding::describe_donors(&donors)
                    );
                    c.place(Slot::Bid, detail);
                }
                None => {
                    let detail = format!(
                        "bid of {tokens} tokens exceeds remaining headroom of {}",
                        headroom.total()
                    );
                    c.place(Slot::Pending(ReasonCode::BidRejected), detail);
                }
            }
        }
    }

    /// Evict lowest-priority (latest on ties) admitted segments until the
    /// pinned content fits.
    fn protect_must_keep(&mut self, available: usize) {
        while self.used() > available {
            let victim = self
                .candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.slot.is_admitted() && c.slot != Slot::Pinned)
                .min_by_key(|(_, c)| (c.segment.priority(), std::cmp::Reverse(c.segment.ordinal())))
                .map(|(i, _)| i);
            let Some(idx) = victim else {
                break;
            };
            self.candidates[idx].place(
                Slot::Dropped(ReasonCode::EvictedForMustKeep),
                "evicted to keep must_keep segments within the window",
            );
        }
    }

    fn drop_pending(&mut self) {
        for c in self.candidates.iter_mut() {
            if let Slot::Pending(reason) = c.slot {
                c.slot = Slot::Dropped(reason);
            }
        }
    }

    /// Per-type capacity for overflow resolution: reservation (or pinned
    /// usage, if larger) plus elastic share plus tokens won by bidding.
    fn type_caps(
        &self,
        policy: &BudgetPolicy,
        shares: &BTreeMap<SegmentType, usize>,
    ) -> BTreeMap<SegmentType, usize> {
        let pinned = self.pinned_by_type();
        SegmentType::ALL
            .into_iter()
            .map(|t| {
                let bid: usize = self
                    .candidates
                    .iter()
                    .filter(|c| c.slot == Slot::Bid && c.segment.segment_type() == t)
                    .map(Candidate::tokens)
                    .sum();
                let reserved = policy.rigid_for(t).max(pinned.get(&t).copied().unwrap_or(0));
                (t, reserved + shares.get(&t).copied().unwrap_or(0) + bid)
            })
            .collect()
    }

    /// Lowest-priority (latest on ties) admitted, non-pinned segment of
    /// `segment_type` below `priority` that has not been compressed yet.
    fn compression_victim(
        &self,
        segment_type: SegmentType,
        priority: i64,
        compressed: &BTreeSet<SegmentId>,
    ) -> Option<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.slot.is_admitted()
                    && c.slot != Slot::Pinned
                    && c.segment.segment_type() == segment_type
                    && c.segment.priority() < priority
                    && !compressed.contains(c.segment.id())
            })
            .min_by_key(|(_, c)| (c.segment.priority(), std::cmp::Reverse(c.segment.ordinal())))
            .map(|(i, _)| i)
    }

    fn summarize(
        &self,
        policy: &BudgetPolicy,
        shares: &BTreeMap<SegmentType, usize>,
        headroom_unused: usize,
    ) -> BudgetAllocation {
        let mut per_type = BTreeMap::new();
        for segment_type in SegmentType::ALL {
            let mut stats = TypeAllocation {
                rigid_reserved: policy.rigid_for(segment_type),
                elastic_share: shares.get(&segment_type).copied().unwrap_or(0),
                ..TypeAllocation::default()
            };
            for c in self
                .candidates
                .iter()
                .filter(|c| c.segment.segment_type() == segment_type)
            {
                let tokens = c.tokens();
                match c.slot {
                    Slot::Pinned => stats.pinned_used += tokens,
                    Slot::Rigid => stats.rigid_used += tokens,
                    Slot::Elastic | Slot::Overflow => stats.elastic_used += tokens,
                    Slot::Bid => stats.bid_used += tokens,
                    _ => continue,
                }
                stats.tokens_used += tokens;
            }
            if stats.rigid_reserved > 0 || stats.elastic_share > 0 || stats.tokens_used > 0 {
                per_type.insert(segment_type, stats);
            }
        }

        let tokens_used = per_type.values().map(|t| t.tokens_used).sum();
        let available_tokens = policy.available_tokens();
        BudgetAllocation {
            available_tokens,
            per_type,
            tokens_used,
            saturation_rate: saturation(tokens_used, available_tokens),
            headroom_unused,
            dropped: self
                .candidates
                .iter()
                .filter(|c| matches!(c.slot, Slot::Dropped(_) | Slot::Pending(_)))
                .map(|c| c.segment.id().clone())
                .collect(),
        }
    }

    fn record_decisions(&self, journal: &mut StageJournal) {
        for c in &self.candidates {
            let id = c.segment.id();
            let admitted_reason = match c.slot {
                Slot::Pinned => Some(ReasonCode::MustKeepPinned),
                Slot::Rigid => Some(ReasonCode::RigidReserved),
                Slot::Elastic => Some(ReasonCode::ElasticAdmitted),
                Slot::Bid => Some(ReasonCode::BidWon),
                Slot::Overflow => Some(ReasonCode::AdmittedAfterCompression),
                Slot::Unplaced | Slot::Pending(_) | Slot::Dropped(_) => None,
            };
            match (admitted_reason, c.compressed_from) {
                (Some(_), Some(before)) => {
                    let reason = if c.slot == Slot::Overflow {
                        ReasonCode::OverflowCompressed
                    } else {
                        ReasonCode::CompressedForHeadroom
                    };
                    journal.compress(id, reason, before, c.tokens(), c.detail.clone());
                }
                (Some(reason), None) => {
                    journal.keep(id, reason, c.detail.clone());
                }
                (None, _) => {
                    let reason = match c.slot {
                        Slot::Pending(reason) | Slot::Dropped(reason) => reason,
                        _ => ReasonCode::NoElasticShare,
                    };
                    journal.drop(id, reason, c.detail.clone());
                }
            }
        }
    }

    fn into_admitted(self) -> Vec<Segment> {
        self.candidates
            .into_iter()
            .filter(|c| c.slot.is_admitted())
            .map(|c| c.segment)
            .collect()
    }
}
