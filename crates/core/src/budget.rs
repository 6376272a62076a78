//! Budget policy and allocation records.
//!
//! [`BudgetPolicy`] is what the caller configures; [`BudgetAllocation`] is
//! what the allocate stage reports back. The allocation algorithm itself
//! lives in `ctxforge-budget`.

use crate::error::PolicyError;
use crate::segment::{SegmentId, SegmentType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance for floating-point ratio sums (0.1 + 0.2 + 0.7 and friends).
pub const RATIO_EPSILON: f64 = 1e-9;

/// What to do with segments that remain unadmitted after bidding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Drop the unadmitted segments.
    #[default]
    TruncateLowestPriority,
    /// Compress lower-priority admitted segments of the same type to make room.
    Compress,
    /// Fail the build, naming every unadmitted segment.
    Error,
}

/// What to do with segments that do not fit their type's rigid reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RigidOverflow {
    /// Compete for the type's elastic share (and bidding headroom).
    #[default]
    Elastic,
    /// Leave them unadmitted.
    Drop,
}

/// Token budget configuration for one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    /// Size of the model's context window.
    #[serde(default = "default_total_window_tokens")]
    pub total_window_tokens: usize,

    /// Tokens kept free for the model's answer.
    #[serde(default = "default_reserved_output_tokens")]
    pub reserved_output_tokens: usize,

    /// Fixed per-type reservations, granted before any competition.
    #[serde(default = "default_rigid_tokens")]
    pub rigid_tokens: BTreeMap<SegmentType, usize>,

    /// Share of the elastic pool per type. Must sum to at most 1.0.
    #[serde(default = "default_elastic_ratios")]
    pub elastic_ratios: BTreeMap<SegmentType, f64>,

    /// Saturation above which a warning is raised and the compression gate
    /// kicks in.
    #[serde(default = "default_saturation_threshold")]
    pub saturation_threshold: f64,

    #[serde(default)]
    pub overflow_strategy: OverflowStrategy,

    #[serde(default)]
    pub rigid_overflow: RigidOverflow,

    /// Target size of a compressed segment relative to the original.
    #[serde(default = "default_compression_target_ratio")]
    pub compression_target_ratio: f64,
}

fn default_total_window_tokens() -> usize {
    128_000
}
fn default_reserved_output_tokens() -> usize {
    4_096
}
fn default_saturation_threshold() -> f64 {
    0.85
}
fn default_compression_target_ratio() -> f64 {
    0.5
}
fn default_rigid_tokens() -> BTreeMap<SegmentType, usize> {
    BTreeMap::from([(SegmentType::System, 2_048)])
}
fn default_elastic_ratios() -> BTreeMap<SegmentType, f64> {
    BTreeMap::from([
        (SegmentType::FewShot, 0.10),
        (SegmentType::Tools, 0.10),
        (SegmentType::Messages, 0.35),
        (SegmentType::Rag, 0.35),
        (SegmentType::State, 0.05),
        (SegmentType::Extra, 0.05),
    ])
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            total_window_tokens: default_total_window_tokens(),
            reserved_output_tokens: default_reserved_output_tokens(),
            rigid_tokens: default_rigid_tokens(),
            elastic_ratios: default_elastic_ratios(),
            saturation_threshold: default_saturation_threshold(),
            overflow_strategy: OverflowStrategy::default(),
            rigid_overflow: RigidOverflow::default(),
            compression_target_ratio: default_compression_target_ratio(),
        }
    }
}

impl BudgetPolicy {
    /// A policy with a window and nothing else configured.
    pub fn with_window(total_window_tokens: usize, reserved_output_tokens: usize) -> Self {
        Self {
            total_window_tokens,
            reserved_output_tokens,
            rigid_tokens: BTreeMap::new(),
            elastic_ratios: BTreeMap::new(),
            ..Self::default()
        }
    }

    pub fn rigid(mut self, segment_type: SegmentType, tokens: usize) -> Self {
        self.rigid_tokens.insert(segment_type, tokens);
        self
    }

    pub fn elastic(mut self, segment_type: SegmentType, ratio: f64) -> Self {
        self.elastic_ratios.insert(segment_type, ratio);
        self
    }

    pub fn overflow(mut self, strategy: OverflowStrategy) -> Self {
        self.overflow_strategy = strategy;
        self
    }

    /// Tokens available for content: window minus the output reservation.
    pub fn available_tokens(&self) -> usize {
        self.total_window_tokens
            .saturating_sub(self.reserved_output_tokens)
    }

    pub fn rigid_for(&self, segment_type: SegmentType) -> usize {
        self.rigid_tokens.get(&segment_type).copied().unwrap_or(0)
    }

    pub fn ratio_for(&self, segment_type: SegmentType) -> f64 {
        self.elastic_ratios.get(&segment_type).copied().unwrap_or(0.0)
    }

    /// Sum of rigid reservations, saturating at `usize::MAX`.
    pub fn rigid_total(&self) -> usize {
        self.rigid_tokens
            .values()
            .fold(0usize, |acc, tokens| acc.saturating_add(*tokens))
    }

    pub fn ratio_sum(&self) -> f64 {
        self.elastic_ratios.values().sum()
    }

    /// Validate the policy. Called at load time and when a pipeline is built,
    /// so a bad policy never reaches a build.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.total_window_tokens == 0 {
            return Err(PolicyError::EmptyWindow);
        }
        if self.reserved_output_tokens >= self.total_window_tokens {
            return Err(PolicyError::ReservedExceedsWindow {
                reserved: self.reserved_output_tokens,
                total: self.total_window_tokens,
            });
        }
        let available = self.available_tokens();
        if self.rigid_total() > available {
            return Err(PolicyError::RigidExceedsWindow {
                rigid: self.rigid_total(),
                available,
            });
        }
        for (segment_type, ratio) in &self.elastic_ratios {
            if !(0.0..=1.0).contains(ratio) {
                return Err(PolicyError::RatioOutOfRange {
                    segment_type: segment_type.to_string(),
                    ratio: *ratio,
                });
            }
        }
        let sum = self.ratio_sum();
        if sum > 1.0 + RATIO_EPSILON {
            return Err(PolicyError::RatiosExceedOne { sum });
        }
        if !(0.0..=1.0).contains(&self.saturation_threshold) {
            return Err(PolicyError::OutOfRange {
                field: "saturation_threshold",
                range: "0.0..=1.0",
                value: self.saturation_threshold,
            });
        }
        if !(self.compression_target_ratio > 0.0 && self.compression_target_ratio <= 1.0) {
            return Err(PolicyError::OutOfRange {
                field: "compression_target_ratio",
                range: "(0.0, 1.0]",
                value: self.compression_target_ratio,
            });
        }
        Ok(())
    }
}

/// Per-type usage reported by the allocate stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeAllocation {
    /// Rigid reservation configured for the type.
    pub rigid_reserved: usize,
    /// Elastic share computed for the type.
    pub elastic_share: usize,
    /// Tokens consumed by must_keep segments.
    pub pinned_used: usize,
    /// Tokens admitted inside the rigid reservation.
    pub rigid_used: usize,
    /// Tokens admitted inside the elastic share.
    pub elastic_used: usize,
    /// Tokens won from other types' unused headroom.
    pub bid_used: usize,
    /// Tokens reclaimed by the compress stage after allocation. The phase
    /// counters above keep their allocation-time values.
    #[serde(default)]
    pub compression_saved: usize,
    /// Everything admitted for the type.
    pub tokens_used: usize,
}

/// Outcome of budget allocation for one build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    /// Window minus output reservation.
    pub available_tokens: usize,
    /// Per-type breakdown (only types that were reserved, shared, or used).
    pub per_type: BTreeMap<SegmentType, TypeAllocation>,
    /// Total admitted tokens.
    pub tokens_used: usize,
    /// `tokens_used / available_tokens`.
    pub saturation_rate: f64,
    /// Elastic headroom nobody claimed.
    pub headroom_unused: usize,
    /// Segments dropped during allocation, in ranked order.
    pub dropped: Vec<SegmentId>,
}

impl BudgetAllocation {
    /// Recompute totals after per-type usage changed (e.g. after compression).
    pub fn refresh_totals(&mut self) {
        self.tokens_used = self.per_type.values().map(|t| t.tokens_used).sum();
        self.saturation_rate = saturation(self.tokens_used, self.available_tokens);
    }

    pub fn used_by(&self, segment_type: SegmentType) -> usize {
        self.per_type
            .get(&segment_type)
            .map(|t| t.tokens_used)
            .unwrap_or(0)
    }
}

/// `used / available`, or 0 when nothing is available.
pub fn saturation(used: usize, available: usize) -> f64 {
    if available == 0 {
        0.0
    } else {
        used as f64 / available as f64
    }
}
