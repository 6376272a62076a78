//! The build orchestrator.
//!
//! A [`Pipeline`] owns the six stages in their fixed order and threads one
//! build through them. After each successful stage the stage's journal is
//! merged into the build context and its audit entries are forwarded to the
//! configured sinks. A failed stage discards its journal; the caller gets the
//! error plus everything recorded by the stages that did complete.

use crate::stage::Stage;
use crate::stages::{
    AllocateStage, AssembleStage, CompressStage, NormalizeStage, RerankStage, SanitizeStage,
};
use chrono::Utc;
use ctxforge_budget::BudgetEngine;
use ctxforge_config::ForgeConfig;
use ctxforge_core::audit::AuditSink;
use ctxforge_core::budget::BudgetPolicy;
use ctxforge_core::compress::{Compressor, CompressorRegistry, TruncationCompressor};
use ctxforge_core::context::{BuildContext, BuildOptions};
use ctxforge_core::error::Error;
use ctxforge_core::package::{BuildFailure, ContextPackage, TokenUsage};
use ctxforge_core::rerank::RerankConfig;
use ctxforge_core::sanitize::{LengthGuard, Sanitizer, SanitizerChain};
use ctxforge_core::segment::Segment;
use ctxforge_core::similarity::{EmbeddingSimilarity, Similarity};
use ctxforge_core::stage::StageKind;
use ctxforge_core::token::{CharCounter, TokenCounter};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A configured, reusable context builder.
///
/// Holds no per-build state: concurrent builds on one pipeline are
/// independent.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    sinks: Vec<Arc<dyn AuditSink>>,
    policy: BudgetPolicy,
    counter: Arc<dyn TokenCounter>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Build a pipeline from a loaded configuration file.
    pub fn from_config(config: &ForgeConfig) -> Result<Self, Error> {
        PipelineBuilder::from_config(config).build()
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    /// Stage kinds in execution order.
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// Run one build and package the result.
    pub async fn build(
        &self,
        segments: Vec<Segment>,
        options: BuildOptions,
    ) -> Result<ContextPackage, BuildFailure> {
        let inputs: Vec<Segment> = segments
            .iter()
            .map(|s| {
                if s.is_counted() {
                    s.clone()
                } else {
                    s.with_token_count(self.counter.count(s.content()))
                }
            })
            .collect();

        let (segments, ctx) = self.execute(segments, options).await?;
        let reference_time = ctx.reference_time();
        let (audit, warnings, allocation) = ctx.into_parts();
        let usage = TokenUsage::from_segments(
            &segments,
            self.policy.available_tokens(),
            self.policy.reserved_output_tokens,
        );
        let dropped = ContextPackage::collect_dropped(&audit, &inputs);

        info!(
            segments = segments.len(),
            tokens = usage.total_tokens,
            remaining = usage.remaining(),
            dropped = dropped.len(),
            warnings = warnings.len(),
            "Context package built"
        );

        Ok(ContextPackage {
            segments,
            usage,
            allocation: allocation.unwrap_or_default(),
            audit,
            dropped,
            warnings,
            reference_time,
        })
    }

    /// Run the stage sequence, returning the final segments and the build
    /// context they were produced under.
    pub async fn execute(
        &self,
        segments: Vec<Segment>,
        options: BuildOptions,
    ) -> Result<(Vec<Segment>, BuildContext), BuildFailure> {
        let reference_time = options.reference_time.unwrap_or_else(Utc::now);
        info!(
            segments = segments.len(),
            available = self.policy.available_tokens(),
            %reference_time,
            namespace = options.namespace.as_deref().unwrap_or("*"),
            "Building context package"
        );

        let mut ctx = BuildContext::new(reference_time).with_namespace(options.namespace.clone());
        let mut current = segments;

        for stage in &self.stages {
            let kind = stage.kind();
            if options.cancel.is_cancelled() {
                warn!(before = %kind, "Build cancelled");
                return Err(failure(Error::Cancelled { before: kind }, ctx));
            }

            let started = Instant::now();
            let input_len = current.len();
            match stage.process(current, &ctx).await {
                Ok(output) => {
                    debug!(
                        stage = %kind,
                        input = input_len,
                        output = output.segments.len(),
                        decisions = output.journal.entries().len(),
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "Stage complete"
                    );
                    ctx = ctx.absorb(kind, output.journal, &self.sinks);
                    current = output.segments;
                }
                Err(e) => {
                    warn!(stage = %kind, error = %e, "Stage failed");
                    return Err(failure(Error::stage(kind, e), ctx));
                }
            }
        }

        Ok((current, ctx))
    }
}

fn failure(error: Error, ctx: BuildContext) -> BuildFailure {
    let (audit, warnings, _) = ctx.into_parts();
    BuildFailure {
        error,
        audit,
        warnings,
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    policy: BudgetPolicy,
    rerank: RerankConfig,
    counter: Arc<dyn TokenCounter>,
    sanitizers: SanitizerChain,
    similarity: Arc<dyn Similarity>,
    compressors: Vec<Arc<dyn Compressor>>,
    compressor: Option<String>,
    compression_enabled: bool,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            policy: BudgetPolicy::default(),
            rerank: RerankConfig::default(),
            counter: Arc::new(CharCounter),
            sanitizers: SanitizerChain::with_defaults(LengthGuard::DEFAULT_MAX_CHARS),
            similarity: Arc::new(EmbeddingSimilarity),
            compressors: Vec::new(),
            compressor: Some(TruncationCompressor::NAME.to_string()),
            compression_enabled: true,
            sinks: Vec::new(),
        }
    }

    /// Builder seeded from a loaded configuration file.
    pub fn from_config(config: &ForgeConfig) -> Self {
        let builder = Self::new()
            .policy(config.budget.clone())
            .rerank(config.rerank.clone())
            .sanitizer_chain(SanitizerChain::with_defaults(
                config.sanitize.max_segment_chars,
            ))
            .compression(config.compress.enabled);
        if config.compress.compressor.trim().is_empty() {
            builder.without_compressor()
        } else {
            builder.compressor(config.compress.compressor.trim())
        }
    }

    pub fn policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn rerank(mut self, rerank: RerankConfig) -> Self {
        self.rerank = rerank;
        self
    }

    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Append a sanitizer after the ones already registered.
    pub fn sanitizer(mut self, sanitizer: Box<dyn Sanitizer>) -> Self {
        self.sanitizers.register(sanitizer);
        self
    }

    /// Replace the whole sanitizer chain. An empty chain disables sanitizing.
    pub fn sanitizer_chain(mut self, chain: SanitizerChain) -> Self {
        self.sanitizers = chain;
        self
    }

    /// Make a compressor available by name.
    pub fn register_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressors.push(compressor);
        self
    }

    /// Select the compressor used by the compress overflow strategy and the
    /// saturation gate.
    pub fn compressor(mut self, name: impl Into<String>) -> Self {
        self.compressor = Some(name.into());
        self
    }

    pub fn without_compressor(mut self) -> Self {
        self.compressor = None;
        self
    }

    /// Enable or disable the saturation gate.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn similarity(mut self, similarity: Arc<dyn Similarity>) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validate the configuration and assemble the stage sequence.
    pub fn build(self) -> Result<Pipeline, Error> {
        self.policy.validate()?;
        self.rerank.validate()?;

        let mut registry = CompressorRegistry::with_defaults(self.counter.clone());
        for compressor in self.compressors {
            registry.register(compressor);
        }
        let compressor = match &self.compressor {
            Some(name) => Some(
                registry
                    .resolve(name)
                    .map_err(|e| Error::stage(StageKind::Compress, e))?,
            ),
            None => None,
        };

        let mut engine = BudgetEngine::new(self.policy.clone());
        if let Some(c) = &compressor {
            engine = engine.with_compressor(c.clone());
        }

        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(NormalizeStage::new(self.counter.clone())),
            Box::new(SanitizeStage::new(self.sanitizers, self.counter.clone())),
            Box::new(RerankStage::new(self.rerank, self.similarity)),
            Box::new(AllocateStage::new(engine)),
            Box::new(CompressStage::new(
                compressor,
                self.compression_enabled,
                self.policy.saturation_threshold,
                self.policy.compression_target_ratio,
            )),
            Box::new(AssembleStage::new()),
        ];
        debug_assert!(
            stages
                .iter()
                .map(|s| s.kind())
                .eq(StageKind::SEQUENCE.iter().copied())
        );

        debug!(
            counter = self.counter.name(),
            compressor = self.compressor.as_deref().unwrap_or("none"),
            sinks = self.sinks.len(),
            "Pipeline built"
        );

        Ok(Pipeline {
            stages,
            sinks: self.sinks,
            policy: self.policy,
            counter: self.counter,
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
