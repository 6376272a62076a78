//! Stage trait — one step of the fixed build sequence.

use async_trait::async_trait;
use ctxforge_core::audit::StageJournal;
use ctxforge_core::context::BuildContext;
use ctxforge_core::error::StageError;
use ctxforge_core::segment::Segment;
use ctxforge_core::stage::StageKind;

/// What a stage hands back: its complete output and its private journal.
#[derive(Debug, Default)]
pub struct StageOutput {
    pub segments: Vec<Segment>,
    pub journal: StageJournal,
}

impl StageOutput {
    pub fn new(segments: Vec<Segment>, journal: StageJournal) -> Self {
        Self { segments, journal }
    }

    /// Output that forwards the input untouched and records nothing.
    pub fn passthrough(segments: Vec<Segment>) -> Self {
        Self::new(segments, StageJournal::new())
    }
}

/// A pipeline stage.
///
/// Stages consume the previous stage's complete output and read the build
/// context; they never modify the context directly. Everything they want
/// recorded goes into the returned journal, which the orchestrator merges
/// only if the stage succeeds.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Which slot of the sequence this stage fills.
    fn kind(&self) -> StageKind;

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &BuildContext,
    ) -> Result<StageOutput, StageError>;
}
