//! Compressor trait — pluggable content reduction.
//!
//! Summarizers, extractive compressors and the like implement
//! [`Compressor`] and are registered by name in a [`CompressorRegistry`].
//! The registry ships with [`TruncationCompressor`], a deterministic
//! fallback that keeps a leading fraction of the content.

use crate::error::CompressError;
use crate::segment::Segment;
use crate::token::TokenCounter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A content compressor.
///
/// Implementations must return a segment with the same id and a fresh
/// token count. The pipeline invokes a compressor at most once per segment
/// per build and never retries on failure.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Unique name (e.g., "truncation").
    fn name(&self) -> &str;

    /// Compress `segment` toward `target_ratio` of its current size.
    async fn compress(
        &self,
        segment: &Segment,
        target_ratio: f64,
    ) -> std::result::Result<Segment, CompressError>;
}

/// A registry of available compressors.
pub struct CompressorRegistry {
    compressors: HashMap<String, Arc<dyn Compressor>>,
}

impl CompressorRegistry {
    pub fn new() -> Self {
        Self {
            compressors: HashMap::new(),
        }
    }

    /// Registry pre-loaded with [`TruncationCompressor`].
    pub fn with_defaults(counter: Arc<dyn TokenCounter>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TruncationCompressor::new(counter)));
        registry
    }

    /// Register a compressor. Replaces any existing one with the same name.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        let name = compressor.name().to_string();
        self.compressors.insert(name, compressor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Compressor>> {
        self.compressors.get(name).cloned()
    }

    /// Look up a compressor, failing when it was never registered.
    pub fn resolve(&self, name: &str) -> std::result::Result<Arc<dyn Compressor>, CompressError> {
        self.get(name)
            .ok_or_else(|| CompressError::UnknownCompressor(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.compressors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompressorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressorRegistry")
            .field("compressors", &self.names())
            .finish()
    }
}

/// Keeps the first `ceil(chars × target_ratio)` characters.
pub struct TruncationCompressor {
    counter: Arc<dyn TokenCounter>,
}

impl TruncationCompressor {
    pub const NAME: &'static str = "truncation";

    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }
}

#[async_trait]
impl Compressor for TruncationCompressor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn compress(
        &self,
        segment: &Segment,
        target_ratio: f64,
    ) -> std::result::Result<Segment, CompressError> {
        if !(target_ratio > 0.0 && target_ratio <= 1.0) {
            return Err(CompressError::Failed {
                segment_id: segment.id().clone(),
                compressor: Self::NAME.into(),
                reason: format!("target ratio {target_ratio} outside (0, 1]"),
            });
        }
        let chars = segment.content().chars().count();
        let keep = (chars as f64 * target_ratio).ceil() as usize;
        let content: String = segment.content().chars().take(keep).collect();
        let tokens = self.counter.count(&content);
        Ok(segment.with_content(content).with_token_count(tokens))
    }
}
