//! Build outputs: the context package on success, a failure report otherwise.

use crate::audit::{AuditLog, ReasonCode};
use crate::budget::BudgetAllocation;
use crate::error::Error;
use crate::segment::{Segment, SegmentId, SegmentType};
use crate::stage::StageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Token accounting for the final package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens used by the final segments.
    pub total_tokens: usize,
    /// Window minus the output reservation.
    pub available_tokens: usize,
    pub reserved_output_tokens: usize,
    /// Tokens per segment type (types with no segments are omitted).
    pub per_type: BTreeMap<SegmentType, usize>,
}

impl TokenUsage {
    pub fn from_segments(
        segments: &[Segment],
        available_tokens: usize,
        reserved_output_tokens: usize,
    ) -> Self {
        let mut per_type = BTreeMap::new();
        for segment in segments {
            *per_type.entry(segment.segment_type()).or_insert(0) += segment.token_count();
        }
        Self {
            total_tokens: per_type.values().sum(),
            available_tokens,
            reserved_output_tokens,
            per_type,
        }
    }

    /// Tokens still free before the output reservation.
    pub fn remaining(&self) -> usize {
        self.available_tokens.saturating_sub(self.total_tokens)
    }
}

/// A segment that did not make it into the package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedSegment {
    pub id: SegmentId,
    pub segment_type: SegmentType,
    pub stage: StageKind,
    pub reason_code: ReasonCode,
    pub tokens: usize,
}

/// The assembled, budget-respecting result of a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPackage {
    /// Final segments in layout order.
    pub segments: Vec<Segment>,
    pub usage: TokenUsage,
    pub allocation: BudgetAllocation,
    pub audit: AuditLog,
    /// Everything dropped along the way, in audit order.
    pub dropped: Vec<DroppedSegment>,
    pub warnings: Vec<String>,
    pub reference_time: DateTime<Utc>,
}

impl ContextPackage {
    /// Collect dropped segments from the audit log, using the caller's input
    /// for types and token counts.
    pub fn collect_dropped(audit: &AuditLog, inputs: &[Segment]) -> Vec<DroppedSegment> {
        let by_id: BTreeMap<&SegmentId, &Segment> = inputs.iter().map(|s| (s.id(), s)).collect();
        audit
            .drops()
            .map(|e| {
                let input = by_id.get(&e.segment_id);
                DroppedSegment {
                    id: e.segment_id.clone(),
                    segment_type: input.map(|s| s.segment_type()).unwrap_or(SegmentType::Extra),
                    stage: e.stage,
                    reason_code: e.reason_code,
                    tokens: input.map(|s| s.token_count()).unwrap_or(0),
                }
            })
            .collect()
    }

    pub fn contains(&self, id: &SegmentId) -> bool {
        self.segments.iter().any(|s| s.id() == id)
    }

    pub fn segment_ids(&self) -> Vec<&SegmentId> {
        self.segments.iter().map(|s| s.id()).collect()
    }

    /// The final segments joined into one prompt body.
    pub fn render(&self, separator: &str) -> String {
        self.segments
            .iter()
            .map(|s| s.content())
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// A failed build: the error plus everything recorded before it.
#[derive(Debug)]
pub struct BuildFailure {
    pub error: Error,
    /// Audit entries merged by the stages that completed.
    pub audit: AuditLog,
    pub warnings: Vec<String>,
}

impl std::fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} audit entries recorded)", self.error, self.audit.len())
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
