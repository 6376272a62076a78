//! Normalize stage: strip invisible characters, assign ordinals, count tokens.

use crate::stage::{Stage, StageOutput};
use async_trait::async_trait;
use ctxforge_core::audit::{ReasonCode, StageJournal};
use ctxforge_core::context::BuildContext;
use ctxforge_core::error::StageError;
use ctxforge_core::segment::{Segment, SegmentId};
use ctxforge_core::stage::StageKind;
use ctxforge_core::token::TokenCounter;
use std::collections::HashSet;
use std::sync::Arc;

pub struct NormalizeStage {
    counter: Arc<dyn TokenCounter>,
}

impl NormalizeStage {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self { counter }
    }
}

#[async_trait]
impl Stage for NormalizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Normalize
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        _ctx: &BuildContext,
    ) -> Result<StageOutput, StageError> {
        let mut journal = StageJournal::new();
        let mut seen: HashSet<SegmentId> = HashSet::with_capacity(segments.len());
        let mut output = Vec::with_capacity(segments.len());

        for (ordinal, segment) in segments.into_iter().enumerate() {
            if !seen.insert(segment.id().clone()) {
                return Err(StageError::DuplicateSegment {
                    segment_id: segment.id().clone(),
                    position: ordinal,
                });
            }

            let mut segment = segment.with_ordinal(ordinal);
            if let Some((cleaned, removed)) = strip_invisible(segment.content()) {
                segment = segment.with_content(cleaned);
                journal.keep(
                    segment.id(),
                    ReasonCode::ContentNormalized,
                    format!("removed {removed} invisible or control characters"),
                );
            }
            if !segment.is_counted() {
                let tokens = self.counter.count(segment.content());
                segment = segment.with_token_count(tokens);
            }
            output.push(segment);
        }

        tracing::debug!(
            segments = output.len(),
            normalized = journal.entries().len(),
            counter = self.counter.name(),
            "Normalized segments"
        );
        Ok(StageOutput::new(output, journal))
    }
}

/// Remove characters that carry no visible content. Returns `None` when the
/// text is already clean, otherwise the cleaned text and how many characters
/// were removed.
pub fn strip_invisible(text: &str) -> Option<(String, usize)> {
    let removed = text.chars().filter(|c| is_invisible(*c)).count();
    if removed == 0 {
        return None;
    }
    let cleaned = text.chars().filter(|c| !is_invisible(*c)).collect();
    Some((cleaned, removed))
}

fn is_invisible(c: char) -> bool {
    match c {
        '\t' | '\n' | '\r' => false,
        // zero-width, BOM
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' => true,
        // bidi marks, embeddings, overrides, isolates
        '\u{061C}' | '\u{200E}' | '\u{200F}' => true,
        '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' => true,
        c => c.is_control(),
    }
}
