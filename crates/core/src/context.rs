//! Build context: state threaded through the pipeline for one build.
//!
//! The context is read-only for stages. After a stage succeeds, the
//! orchestrator folds that stage's [`StageJournal`] into a new context with
//! [`BuildContext::absorb`]. Nothing a failed stage journaled is ever merged.

use crate::audit::{AuditEntry, AuditLog, AuditSink, StageJournal};
use crate::budget::BudgetAllocation;
use crate::segment::SegmentId;
use crate::stage::StageKind;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation handle, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-build options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Clock used for TTL expiry. Defaults to the time the build starts.
    pub reference_time: Option<DateTime<Utc>>,
    /// Namespace the build runs for. Segments restricted to another
    /// namespace are dropped by rerank.
    pub namespace: Option<String>,
    pub cancel: CancelFlag,
}

impl BuildOptions {
    pub fn at(reference_time: DateTime<Utc>) -> Self {
        Self {
            reference_time: Some(reference_time),
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Accumulated build state.
#[derive(Debug, Clone)]
pub struct BuildContext {
    reference_time: DateTime<Utc>,
    namespace: Option<String>,
    audit: AuditLog,
    warnings: Vec<String>,
    metadata: BTreeMap<String, serde_json::Value>,
    allocation: Option<BudgetAllocation>,
    compressed: BTreeSet<SegmentId>,
}

impl BuildContext {
    pub fn new(reference_time: DateTime<Utc>) -> Self {
        Self {
            reference_time,
            namespace: None,
            audit: AuditLog::new(),
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
            allocation: None,
            compressed: BTreeSet::new(),
        }
    }

    /// Restrict the build to one visibility namespace.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// The allocation reported by the allocate stage (refreshed by compress).
    pub fn allocation(&self) -> Option<&BudgetAllocation> {
        self.allocation.as_ref()
    }

    /// Whether the segment has already been compressed in this build.
    pub fn is_compressed(&self, id: &SegmentId) -> bool {
        self.compressed.contains(id)
    }

    /// Every segment that has used its one compression pass.
    pub fn compressed_ids(&self) -> &BTreeSet<SegmentId> {
        &self.compressed
    }

    /// Merge a completed stage's journal, returning the successor context.
    ///
    /// Sequenced entries are forwarded to every sink in order.
    pub fn absorb(
        mut self,
        stage: StageKind,
        journal: StageJournal,
        sinks: &[Arc<dyn AuditSink>],
    ) -> Self {
        let parts = journal.into_parts();
        let appended: &[AuditEntry] = self.audit.append(stage, parts.entries);
        for entry in appended {
            for sink in sinks {
                sink.record(entry);
            }
        }
        for warning in &parts.warnings {
            tracing::warn!(stage = %stage, "{warning}");
        }
        self.warnings.extend(parts.warnings);
        self.metadata.extend(parts.metadata);
        if let Some(allocation) = parts.allocation {
            self.allocation = Some(allocation);
        }
        self.compressed.extend(parts.compressed);
        self
    }

    pub fn into_parts(self) -> (AuditLog, Vec<String>, Option<BudgetAllocation>) {
        (self.audit, self.warnings, self.allocation)
    }
}
