//! Compress stage: the saturation gate.
//!
//! When the allocation left the window fuller than the saturation
//! threshold, compress just enough of the lowest-priority segments to bring
//! the estimate back under it. Each segment is compressed at most once per
//! build; compression calls run concurrently and are merged back in segment
//! order.

use crate::stage::{Stage, StageOutput};
use async_trait::async_trait;
use ctxforge_core::audit::{ReasonCode, StageJournal};
use ctxforge_core::compress::Compressor;
use ctxforge_core::context::BuildContext;
use ctxforge_core::error::{CompressError, StageError};
use ctxforge_core::segment::Segment;
use ctxforge_core::stage::StageKind;
use futures::future::join_all;
use std::sync::Arc;

pub struct CompressStage {
    compressor: Option<Arc<dyn Compressor>>,
    enabled: bool,
    saturation_threshold: f64,
    target_ratio: f64,
}

impl CompressStage {
    pub fn new(
        compressor: Option<Arc<dyn Compressor>>,
        enabled: bool,
        saturation_threshold: f64,
        target_ratio: f64,
    ) -> Self {
        Self {
            compressor,
            enabled,
            saturation_threshold,
            target_ratio,
        }
    }

    /// Indices to compress: lowest priority first (latest on ties) until the
    /// estimated saving covers `excess`.
    fn choose(&self, segments: &[Segment], ctx: &BuildContext, excess: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..segments.len())
            .filter(|&i| !segments[i].must_keep() && !ctx.is_compressed(segments[i].id()))
            .collect();
        order.sort_by_key(|&i| {
            (
                segments[i].priority(),
                std::cmp::Reverse(segments[i].ordinal()),
            )
        });

        let mut chosen = Vec::new();
        let mut estimate = 0.0;
        for i in order {
            if estimate >= excess as f64 {
                break;
            }
            estimate += segments[i].token_count() as f64 * (1.0 - self.target_ratio);
            chosen.push(i);
        }
        chosen.sort_unstable();
        chosen
    }
}

#[async_trait]
impl Stage for CompressStage {
    fn kind(&self) -> StageKind {
        StageKind::Compress
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &BuildContext,
    ) -> Result<StageOutput, StageError> {
        let (Some(compressor), true) = (&self.compressor, self.enabled) else {
            return Ok(StageOutput::passthrough(segments));
        };
        let Some(allocation) = ctx.allocation() else {
            return Ok(StageOutput::passthrough(segments));
        };
        if allocation.saturation_rate <= self.saturation_threshold {
            return Ok(StageOutput::passthrough(segments));
        }

        let available = allocation.available_tokens;
        let target = (self.saturation_threshold * available as f64).floor() as usize;
        let excess = allocation.tokens_used.saturating_sub(target);
        let chosen = self.choose(&segments, ctx, excess);
        tracing::debug!(
            saturation = allocation.saturation_rate,
            excess,
            chosen = chosen.len(),
            compressor = compressor.name(),
            "Saturation above threshold, compressing"
        );

        let results = join_all(
            chosen
                .iter()
                .map(|&i| compressor.compress(&segments[i], self.target_ratio)),
        )
        .await;

        let mut journal = StageJournal::new();
        let mut allocation = allocation.clone();
        let mut segments = segments;
        let mut saved_total = 0;

        for (&i, result) in chosen.iter().zip(results) {
            let original = &segments[i];
            let compressed = result?;
            if compressed.id() != original.id() {
                return Err(CompressError::IdentityChanged {
                    compressor: compressor.name().to_string(),
                    expected: original.id().clone(),
                    actual: compressed.id().clone(),
                }
                .into());
            }
            if !compressed.is_counted() {
                return Err(CompressError::Failed {
                    segment_id: original.id().clone(),
                    compressor: compressor.name().to_string(),
                    reason: "compressed segment carries no token count".into(),
                }
                .into());
            }

            journal.mark_compressed(original.id());
            let before = original.token_count();
            let after = compressed.token_count();
            if after >= before {
                journal.keep(
                    original.id(),
                    ReasonCode::CompressionIneffective,
                    format!("{} returned {after} tokens for {before}", compressor.name()),
                );
                continue;
            }

            journal.compress(
                original.id(),
                ReasonCode::SaturationRelief,
                before,
                after,
                format!("compressed by {} at ratio {}", compressor.name(), self.target_ratio),
            );
            let saved = before - after;
            saved_total += saved;
            if let Some(stats) = allocation.per_type.get_mut(&original.segment_type()) {
                stats.compression_saved += saved;
                stats.tokens_used = stats.tokens_used.saturating_sub(saved);
            }
            segments[i] = compressed;
        }

        allocation.refresh_totals();
        if allocation.saturation_rate > self.saturation_threshold {
            journal.warn(format!(
                "saturation {:.2} still exceeds threshold {:.2} after compression",
                allocation.saturation_rate, self.saturation_threshold
            ));
        }
        journal.note("compress.saved_tokens", serde_json::json!(saved_total));
        journal.set_allocation(allocation);
        Ok(StageOutput::new(segments, journal))
    }
}
