//! Sanitize stage: run the registered sanitizer chain over every segment.

use crate::stage::{Stage, StageOutput};
use async_trait::async_trait;
use ctxforge_core::audit::{ReasonCode, StageJournal};
use ctxforge_core::context::BuildContext;
use ctxforge_core::error::StageError;
use ctxforge_core::sanitize::SanitizerChain;
use ctxforge_core::segment::Segment;
use ctxforge_core::stage::StageKind;
use ctxforge_core::token::TokenCounter;
use std::sync::Arc;

pub struct SanitizeStage {
    chain: SanitizerChain,
    counter: Arc<dyn TokenCounter>,
}

impl SanitizeStage {
    pub fn new(chain: SanitizerChain, counter: Arc<dyn TokenCounter>) -> Self {
        Self { chain, counter }
    }
}

#[async_trait]
impl Stage for SanitizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Sanitize
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        _ctx: &BuildContext,
    ) -> Result<StageOutput, StageError> {
        if self.chain.is_empty() {
            return Ok(StageOutput::passthrough(segments));
        }

        let mut journal = StageJournal::new();
        let mut output = Vec::with_capacity(segments.len());

        for original in segments {
            let cleaned = self.chain.apply(original.clone())?;
            if cleaned.id() != original.id() {
                return Err(StageError::Internal(format!(
                    "sanitizer chain changed segment id {} to {}",
                    original.id(),
                    cleaned.id()
                )));
            }

            if cleaned.content() == original.content() {
                output.push(if cleaned.is_counted() {
                    cleaned
                } else {
                    cleaned.with_token_count(original.token_count())
                });
                continue;
            }

            let before = original.token_count();
            let after = self.counter.count(cleaned.content());
            let cleaned = cleaned.with_token_count(after);
            if original.content().starts_with(cleaned.content()) {
                journal.truncate(
                    cleaned.id(),
                    ReasonCode::ContentTruncated,
                    before,
                    after,
                    format!(
                        "truncated from {} to {} characters",
                        original.content().chars().count(),
                        cleaned.content().chars().count()
                    ),
                );
            } else {
                journal.keep(
                    cleaned.id(),
                    ReasonCode::ContentSanitized,
                    format!("content rewritten by {}", self.chain.names().join(" → ")),
                );
            }
            output.push(cleaned);
        }

        tracing::debug!(
            segments = output.len(),
            changed = journal.entries().len(),
            "Sanitized segments"
        );
        Ok(StageOutput::new(output, journal))
    }
}
