//! Allocate stage: hand ranked segments to the budget engine.

use crate::stage::{Stage, StageOutput};
use async_trait::async_trait;
use ctxforge_budget::BudgetEngine;
use ctxforge_core::context::BuildContext;
use ctxforge_core::error::StageError;
use ctxforge_core::segment::Segment;
use ctxforge_core::stage::StageKind;

pub struct AllocateStage {
    engine: BudgetEngine,
}

impl AllocateStage {
    pub fn new(engine: BudgetEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Stage for AllocateStage {
    fn kind(&self) -> StageKind {
        StageKind::Allocate
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &BuildContext,
    ) -> Result<StageOutput, StageError> {
        let allocated = self.engine.allocate(segments, ctx.compressed_ids()).await?;
        tracing::debug!(
            admitted = allocated.segments.len(),
            used = allocated.allocation.tokens_used,
            saturation = allocated.allocation.saturation_rate,
            "Allocated token budget"
        );
        Ok(StageOutput::new(allocated.segments, allocated.journal))
    }
}
