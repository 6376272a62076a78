//! Assemble stage: final layout of the admitted segments.
//!
//! System, few-shot and tool segments lead, in that order; everything else
//! follows in the order it arrived. Within a type, arrival order is kept.

use crate::stage::{Stage, StageOutput};
use async_trait::async_trait;
use ctxforge_core::audit::{ReasonCode, StageJournal};
use ctxforge_core::context::BuildContext;
use ctxforge_core::error::StageError;
use ctxforge_core::segment::{Segment, SegmentType};
use ctxforge_core::stage::StageKind;

const LEADING: [SegmentType; 3] = [SegmentType::System, SegmentType::FewShot, SegmentType::Tools];

#[derive(Default)]
pub struct AssembleStage;

impl AssembleStage {
    pub fn new() -> Self {
        Self
    }
}

fn layout_rank(segment_type: SegmentType) -> usize {
    LEADING
        .iter()
        .position(|t| *t == segment_type)
        .unwrap_or(LEADING.len())
}

#[async_trait]
impl Stage for AssembleStage {
    fn kind(&self) -> StageKind {
        StageKind::Assemble
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        _ctx: &BuildContext,
    ) -> Result<StageOutput, StageError> {
        let mut indexed: Vec<(usize, Segment)> = segments.into_iter().enumerate().collect();
        indexed.sort_by_key(|(i, s)| (layout_rank(s.segment_type()), *i));

        let mut journal = StageJournal::new();
        let output: Vec<Segment> = indexed
            .into_iter()
            .enumerate()
            .map(|(position, (previous, segment))| {
                if position == previous {
                    journal.keep(
                        segment.id(),
                        ReasonCode::Assembled,
                        format!("position {position}"),
                    );
                } else {
                    journal.reorder(
                        segment.id(),
                        ReasonCode::Layout,
                        format!("{} moved from {previous} to {position}", segment.segment_type()),
                    );
                }
                segment
            })
            .collect();

        Ok(StageOutput::new(output, journal))
    }
}
