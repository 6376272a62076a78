//! Audit trail — the append-only record of every pipeline decision.
//!
//! Stages never write to the shared log directly. Each stage fills a private
//! [`StageJournal`]; the orchestrator merges it into the [`AuditLog`] once the
//! stage has completed, assigning logical sequence numbers in the order the
//! stage produced its decisions. Sequence numbers are counters, not
//! timestamps, so replaying a build yields an identical log.

use crate::budget::BudgetAllocation;
use crate::segment::SegmentId;
use crate::stage::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// What happened to a segment at one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Keep,
    Drop,
    Compress,
    Truncate,
    Reorder,
}

/// Machine-readable reason attached to every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // normalize / sanitize
    ContentNormalized,
    ContentSanitized,
    ContentTruncated,
    // rerank
    NamespaceHidden,
    TtlExpired,
    Duplicate,
    NearDuplicate,
    DiversityLimit,
    PrioritySort,
    // allocate
    MustKeepPinned,
    RigidReserved,
    RigidReservationExhausted,
    ElasticAdmitted,
    ElasticShareExhausted,
    NoElasticShare,
    BidWon,
    BidRejected,
    EvictedForMustKeep,
    CompressedForHeadroom,
    OverflowCompressed,
    AdmittedAfterCompression,
    CompressionInsufficient,
    // compress
    SaturationRelief,
    CompressionIneffective,
    // assemble
    Layout,
    Assembled,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContentNormalized => "content_normalized",
            Self::ContentSanitized => "content_sanitized",
            Self::ContentTruncated => "content_truncated",
            Self::NamespaceHidden => "namespace_hidden",
            Self::TtlExpired => "ttl_expired",
            Self::Duplicate => "duplicate",
            Self::NearDuplicate => "near_duplicate",
            Self::DiversityLimit => "diversity_limit",
            Self::PrioritySort => "priority_sort",
            Self::MustKeepPinned => "must_keep_pinned",
            Self::RigidReserved => "rigid_reserved",
            Self::RigidReservationExhausted => "rigid_reservation_exhausted",
            Self::ElasticAdmitted => "elastic_admitted",
            Self::ElasticShareExhausted => "elastic_share_exhausted",
            Self::NoElasticShare => "no_elastic_share",
            Self::BidWon => "bid_won",
            Self::BidRejected => "bid_rejected",
            Self::EvictedForMustKeep => "evicted_for_must_keep",
            Self::CompressedForHeadroom => "compressed_for_headroom",
            Self::OverflowCompressed => "overflow_compressed",
            Self::AdmittedAfterCompression => "admitted_after_compression",
            Self::CompressionInsufficient => "compression_insufficient",
            Self::SaturationRelief => "saturation_relief",
            Self::CompressionIneffective => "compression_ineffective",
            Self::Layout => "layout",
            Self::Assembled => "assembled",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Logical position in the build's log, starting at 1.
    pub sequence: u64,
    pub segment_id: SegmentId,
    pub stage: StageKind,
    pub decision: Decision,
    pub reason_code: ReasonCode,
    pub reason_detail: String,
    /// Token count before the decision (compression and truncation only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_before: Option<usize>,
    /// Token count after the decision (compression and truncation only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_after: Option<usize>,
}

/// A decision recorded by a stage before it is sequenced.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub segment_id: SegmentId,
    pub decision: Decision,
    pub reason_code: ReasonCode,
    pub reason_detail: String,
    pub tokens_before: Option<usize>,
    pub tokens_after: Option<usize>,
}

/// Private accumulator owned by one stage for the duration of its run.
///
/// Holds at most one decision per segment; a second decision for the same
/// segment is refused.
#[derive(Debug, Default)]
pub struct StageJournal {
    entries: Vec<JournalEntry>,
    seen: HashSet<SegmentId>,
    warnings: Vec<String>,
    metadata: BTreeMap<String, serde_json::Value>,
    allocation: Option<BudgetAllocation>,
    compressed: Vec<SegmentId>,
}

impl StageJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decision. Returns `false` (and records nothing) when the
    /// segment already has a decision in this journal.
    pub fn record(&mut self, entry: JournalEntry) -> bool {
        if !self.seen.insert(entry.segment_id.clone()) {
            tracing::warn!(
                segment_id = %entry.segment_id,
                reason = %entry.reason_code,
                "second decision for segment in one stage ignored"
            );
            return false;
        }
        self.entries.push(entry);
        true
    }

    fn simple(
        &mut self,
        segment_id: &SegmentId,
        decision: Decision,
        reason_code: ReasonCode,
        reason_detail: impl Into<String>,
    ) -> bool {
        self.record(JournalEntry {
            segment_id: segment_id.clone(),
            decision,
            reason_code,
            reason_detail: reason_detail.into(),
            tokens_before: None,
            tokens_after: None,
        })
    }

    pub fn keep(&mut self, id: &SegmentId, reason: ReasonCode, detail: impl Into<String>) -> bool {
        self.simple(id, Decision::Keep, reason, detail)
    }

    pub fn drop(&mut self, id: &SegmentId, reason: ReasonCode, detail: impl Into<String>) -> bool {
        self.simple(id, Decision::Drop, reason, detail)
    }

    pub fn reorder(&mut self, id: &SegmentId, reason: ReasonCode, detail: impl Into<String>) -> bool {
        self.simple(id, Decision::Reorder, reason, detail)
    }

    /// Record a compression with both token counts under the original id.
    pub fn compress(
        &mut self,
        id: &SegmentId,
        reason: ReasonCode,
        tokens_before: usize,
        tokens_after: usize,
        detail: impl Into<String>,
    ) -> bool {
        self.record(JournalEntry {
            segment_id: id.clone(),
            decision: Decision::Compress,
            reason_code: reason,
            reason_detail: detail.into(),
            tokens_before: Some(tokens_before),
            tokens_after: Some(tokens_after),
        })
    }

    pub fn truncate(
        &mut self,
        id: &SegmentId,
        reason: ReasonCode,
        tokens_before: usize,
        tokens_after: usize,
        detail: impl Into<String>,
    ) -> bool {
        self.record(JournalEntry {
            segment_id: id.clone(),
            decision: Decision::Truncate,
            reason_code: reason,
            reason_detail: detail.into(),
            tokens_before: Some(tokens_before),
            tokens_after: Some(tokens_after),
        })
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn note(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn set_allocation(&mut self, allocation: BudgetAllocation) {
        self.allocation = Some(allocation);
    }

    /// Remember that a segment has used its one compression pass.
    pub fn mark_compressed(&mut self, id: &SegmentId) {
        self.compressed.push(id.clone());
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Split into the parts the build context merges.
    pub fn into_parts(self) -> JournalParts {
        JournalParts {
            entries: self.entries,
            warnings: self.warnings,
            metadata: self.metadata,
            allocation: self.allocation,
            compressed: self.compressed,
        }
    }
}

/// Everything a stage hands back to the orchestrator.
#[derive(Debug, Default)]
pub struct JournalParts {
    pub entries: Vec<JournalEntry>,
    pub warnings: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub allocation: Option<BudgetAllocation>,
    pub compressed: Vec<SegmentId>,
}

/// The build's append-only audit log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence and append a stage's decisions; returns the new entries.
    pub fn append(&mut self, stage: StageKind, decisions: Vec<JournalEntry>) -> &[AuditEntry] {
        let start = self.entries.len();
        for decision in decisions {
            let sequence = self.entries.len() as u64 + 1;
            self.entries.push(AuditEntry {
                sequence,
                segment_id: decision.segment_id,
                stage,
                decision: decision.decision,
                reason_code: decision.reason_code,
                reason_detail: decision.reason_detail,
                tokens_before: decision.tokens_before,
                tokens_after: decision.tokens_after,
            });
        }
        &self.entries[start..]
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries about one segment, in sequence order.
    pub fn for_segment<'a>(
        &'a self,
        id: &SegmentId,
    ) -> impl Iterator<Item = &'a AuditEntry> + use<'a> {
        let id = id.clone();
        self.entries.iter().filter(move |e| e.segment_id == id)
    }

    pub fn for_stage(&self, stage: StageKind) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(move |e| e.stage == stage)
    }

    pub fn drops(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter().filter(|e| e.decision == Decision::Drop)
    }
}

/// Trait for audit log sinks (where sequenced entries are forwarded).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// A tracing-based audit sink that logs entries via `tracing::debug!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::debug!(
            sequence = entry.sequence,
            segment_id = %entry.segment_id,
            stage = %entry.stage,
            decision = ?entry.decision,
            reason = %entry.reason_code,
            tokens_before = ?entry.tokens_before,
            tokens_after = ?entry.tokens_after,
            detail = %entry.reason_detail,
            "AUDIT"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SegmentId {
        SegmentId::from(s)
    }

    #[test]
    fn journal_refuses_second_decision_for_segment() {
        let mut journal = StageJournal::new();
        assert!(journal.drop(&id("a"), ReasonCode::TtlExpired, "expired"));
        assert!(!journal.keep(&id("a"), ReasonCode::Assembled, "kept"));
        assert_eq!(journal.entries().len(), 1);
        assert_eq!(journal.entries()[0].decision, Decision::Drop);
    }

    #[test]
    fn append_assigns_monotonic_sequence_across_stages() {
        let mut log = AuditLog::new();
        let mut first = StageJournal::new();
        first.drop(&id("a"), ReasonCode::Duplicate, "dup of b");
        first.reorder(&id("b"), ReasonCode::PrioritySort, "moved");
        log.append(StageKind::Rerank, first.into_parts().entries);

        let mut second = StageJournal::new();
        second.keep(&id("b"), ReasonCode::ElasticAdmitted, "fits");
        let appended = log.append(StageKind::Allocate, second.into_parts().entries);
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].sequence, 3);

        let sequences: Vec<u64> = log.entries().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(log.for_segment(&id("b")).count(), 2);
        assert_eq!(log.for_stage(StageKind::Rerank).count(), 2);
        assert_eq!(log.drops().count(), 1);
    }

    #[test]
    fn compression_records_both_token_counts() {
        let mut journal = StageJournal::new();
        journal.compress(&id("rag-1"), ReasonCode::SaturationRelief, 400, 180, "halved");
        let mut log = AuditLog::new();
        log.append(StageKind::Compress, journal.into_parts().entries);
        let entry = &log.entries()[0];
        assert_eq!(entry.tokens_before, Some(400));
        assert_eq!(entry.tokens_after, Some(180));
        assert_eq!(entry.segment_id, id("rag-1"));
    }

    #[test]
    fn reason_code_string_form_matches_serde() {
        for code in [
            ReasonCode::ElasticShareExhausted,
            ReasonCode::TtlExpired,
            ReasonCode::EvictedForMustKeep,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn tracing_sink_accepts_entries() {
        let entry = AuditEntry {
            sequence: 1,
            segment_id: id("a"),
            stage: StageKind::Assemble,
            decision: Decision::Keep,
            reason_code: ReasonCode::Assembled,
            reason_detail: "final".into(),
            tokens_before: None,
            tokens_after: None,
        };
        TracingSink.record(&entry);
    }
}
