//! Error types for ctxforge.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! wraps any stage failure together with the stage that raised it.
//!
//! Ordinary pipeline decisions (TTL expiry, dedup, low-priority drops) are
//! never errors: they are audited outcomes. Only conditions that make the
//! token-budget contract unsatisfiable, or failures of external
//! collaborators, surface here.

use crate::segment::SegmentId;
use crate::stage::StageKind;
use thiserror::Error;

/// The top-level error type for all ctxforge operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Stage failures ---
    #[error("Pipeline stage `{stage}` failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: StageError,
    },

    // --- Policy validation ---
    #[error("Invalid budget policy: {0}")]
    Policy(#[from] PolicyError),

    // --- Cancellation ---
    #[error("Build cancelled before stage `{before}`")]
    Cancelled { before: StageKind },
}

impl Error {
    /// Wrap a stage failure.
    pub fn stage(stage: StageKind, source: impl Into<StageError>) -> Self {
        Self::Stage {
            stage,
            source: source.into(),
        }
    }

    /// The stage that failed, if this is a stage failure.
    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Segment identifiers needed to reproduce the failure from the audit log.
    pub fn segment_ids(&self) -> Vec<&SegmentId> {
        match self {
            Self::Stage { source, .. } => source.segment_ids(),
            _ => Vec::new(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Root cause of a failed stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Sanitization error: {0}")]
    Sanitize(#[from] SanitizeError),

    #[error("Compression error: {0}")]
    Compress(#[from] CompressError),

    #[error("Duplicate segment id {segment_id} at input position {position}")]
    DuplicateSegment {
        segment_id: SegmentId,
        position: usize,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StageError {
    pub fn segment_ids(&self) -> Vec<&SegmentId> {
        match self {
            Self::Budget(e) => e.segment_ids(),
            Self::Sanitize(e) => vec![e.segment_id()],
            Self::Compress(e) => e.segment_id().into_iter().collect(),
            Self::DuplicateSegment { segment_id, .. } => vec![segment_id],
            Self::Internal(_) => Vec::new(),
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum BudgetError {
    #[error(
        "must_keep segments need {required} tokens but only {available} are available: {}",
        join_ids(.segment_ids)
    )]
    MustKeepExceeded {
        segment_ids: Vec<SegmentId>,
        required: usize,
        available: usize,
    },

    #[error(
        "{} segment(s) could not be admitted within {available} tokens: {}",
        .segment_ids.len(),
        join_ids(.segment_ids)
    )]
    Overflow {
        segment_ids: Vec<SegmentId>,
        requested: usize,
        available: usize,
    },
}

impl BudgetError {
    pub fn segment_ids(&self) -> Vec<&SegmentId> {
        match self {
            Self::MustKeepExceeded { segment_ids, .. } | Self::Overflow { segment_ids, .. } => {
                segment_ids.iter().collect()
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SanitizeError {
    #[error("Segment {segment_id} rejected by {sanitizer}: {reason}")]
    Rejected {
        segment_id: SegmentId,
        sanitizer: String,
        reason: String,
    },

    #[error("Injection pattern `{pattern}` detected in segment {segment_id} by {sanitizer}")]
    InjectionDetected {
        segment_id: SegmentId,
        sanitizer: String,
        pattern: String,
    },
}

impl SanitizeError {
    pub fn segment_id(&self) -> &SegmentId {
        match self {
            Self::Rejected { segment_id, .. } | Self::InjectionDetected { segment_id, .. } => {
                segment_id
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CompressError {
    #[error("Compressor {compressor} failed on segment {segment_id}: {reason}")]
    Failed {
        segment_id: SegmentId,
        compressor: String,
        reason: String,
    },

    #[error("Compressor {compressor} changed segment identity: {expected} became {actual}")]
    IdentityChanged {
        compressor: String,
        expected: SegmentId,
        actual: SegmentId,
    },

    #[error("Compressor not registered: {0}")]
    UnknownCompressor(String),
}

impl CompressError {
    pub fn segment_id(&self) -> Option<&SegmentId> {
        match self {
            Self::Failed { segment_id, .. } => Some(segment_id),
            Self::IdentityChanged { expected, .. } => Some(expected),
            Self::UnknownCompressor(_) => None,
        }
    }
}

/// Budget policy validation failures, raised before any build runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("total_window_tokens must be > 0")]
    EmptyWindow,

    #[error("reserved_output_tokens ({reserved}) must be below total_window_tokens ({total})")]
    ReservedExceedsWindow { reserved: usize, total: usize },

    #[error("rigid reservations ({rigid} tokens) exceed the available window ({available} tokens)")]
    RigidExceedsWindow { rigid: usize, available: usize },

    #[error("elastic ratio for `{segment_type}` must be within 0.0..=1.0, got {ratio}")]
    RatioOutOfRange { segment_type: String, ratio: f64 },

    #[error("elastic ratios sum to {sum:.3}, which exceeds 1.0")]
    RatiosExceedOne { sum: f64 },

    #[error("{field} must be within {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f64,
    },
}

fn join_ids(ids: &[SegmentId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
