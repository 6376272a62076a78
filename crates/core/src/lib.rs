//! # ctxforge Core
//!
//! Domain types, traits, and error definitions for the ctxforge context
//! builder. This crate has no pipeline logic: it defines the segment model,
//! the budget policy, the audit trail, and the collaborator traits that the
//! budget engine and pipeline crates implement against.
//!
//! ## Design Philosophy
//!
//! Every pluggable collaborator is a trait here with a small default
//! implementation:
//! - [`TokenCounter`] / [`CharCounter`]
//! - [`Sanitizer`] / [`LengthGuard`], chained by [`SanitizerChain`]
//! - [`Compressor`] / [`TruncationCompressor`], registered in [`CompressorRegistry`]
//! - [`Similarity`] / [`EmbeddingSimilarity`]
//! - [`AuditSink`] / [`TracingSink`]

pub mod audit;
pub mod budget;
pub mod compress;
pub mod context;
pub mod error;
pub mod package;
pub mod rerank;
pub mod sanitize;
pub mod segment;
pub mod similarity;
pub mod stage;
pub mod token;

// Re-export key types at crate root for ergonomics
pub use audit::{AuditEntry, AuditLog, AuditSink, Decision, ReasonCode, StageJournal, TracingSink};
pub use budget::{
    BudgetAllocation, BudgetPolicy, OverflowStrategy, RigidOverflow, TypeAllocation,
};
pub use compress::{Compressor, CompressorRegistry, TruncationCompressor};
pub use context::{BuildContext, BuildOptions, CancelFlag};
pub use error::{
    BudgetError, CompressError, Error, PolicyError, Result, SanitizeError, StageError,
};
pub use package::{BuildFailure, ContextPackage, DroppedSegment, TokenUsage};
pub use rerank::RerankConfig;
pub use sanitize::{LengthGuard, Sanitizer, SanitizerChain};
pub use segment::{Segment, SegmentId, SegmentMetadata, SegmentType, rank_order};
pub use similarity::{EmbeddingSimilarity, Similarity};
pub use stage::StageKind;
pub use token::{CharCounter, TokenCounter};
