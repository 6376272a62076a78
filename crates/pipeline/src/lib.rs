//! # ctxforge Pipeline
//!
//! Turns a caller's candidate segments into a [`ContextPackage`] that fits
//! the token budget, recording every decision on the way.
//!
//! ## Stages
//!
//! Every build runs the same six stages in the same order:
//!
//! 1. **Normalize**: strip invisible characters, assign input ordinals,
//!    count tokens
//! 2. **Sanitize**: run the sanitizer chain
//! 3. **Rerank**: expire by TTL, deduplicate, diversify, sort by priority
//! 4. **Allocate**: pinned, rigid, elastic and bidding admission
//! 5. **Compress**: relieve saturation above the threshold
//! 6. **Assemble**: final layout
//!
//! ```ignore
//! let pipeline = Pipeline::builder()
//!     .policy(BudgetPolicy::with_window(8_000, 1_000).elastic(SegmentType::Rag, 0.6))
//!     .build()?;
//! let package = pipeline.build(segments, BuildOptions::default()).await?;
//! ```

pub mod pipeline;
pub mod stage;
pub mod stages;

pub use ctxforge_core::context::{BuildOptions, CancelFlag};
pub use ctxforge_core::package::{BuildFailure, ContextPackage};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use stage::{Stage, StageOutput};
