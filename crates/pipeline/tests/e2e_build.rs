//! End-to-end tests for the context build pipeline.
//!
//! These run whole builds through all six stages and check the package, the
//! audit trail, and the failure reports.

use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use ctxforge_config::ForgeConfig;
use ctxforge_core::audit::{AuditEntry, AuditSink, Decision, ReasonCode};
use ctxforge_core::budget::{BudgetPolicy, OverflowStrategy};
use ctxforge_core::compress::Compressor;
use ctxforge_core::error::{BudgetError, CompressError, Error, SanitizeError, StageError};
use ctxforge_core::sanitize::Sanitizer;
use ctxforge_core::segment::{Segment, SegmentId, SegmentType};
use ctxforge_core::stage::StageKind;
use ctxforge_pipeline::{BuildOptions, CancelFlag, Pipeline};

// ── Fixtures ─────────────────────────────────────────────────────────────

fn seg(id: &str, segment_type: SegmentType, content: &str, tokens: usize, priority: i64) -> Segment {
    Segment::new(content, segment_type)
        .with_id(SegmentId::from(id))
        .with_token_count(tokens)
        .with_priority(priority)
}

fn scenario_a_policy() -> BudgetPolicy {
    BudgetPolicy::with_window(100, 0)
        .rigid(SegmentType::System, 20)
        .elastic(SegmentType::Rag, 0.5)
        .elastic(SegmentType::Messages, 0.5)
}

fn scenario_a_segments() -> Vec<Segment> {
    vec![
        seg("sys", SegmentType::System, "You are a careful assistant.", 18, 100),
        seg("rag-3", SegmentType::Rag, "alpha passage about rust", 40, 3),
        seg("rag-2", SegmentType::Rag, "beta passage about tokio", 40, 2),
        seg("rag-1", SegmentType::Rag, "gamma passage about serde", 40, 1),
    ]
}

fn ids(segments: &[Segment]) -> Vec<&str> {
    segments.iter().map(|s| s.id().as_str()).collect()
}

fn fixed_time() -> BuildOptions {
    BuildOptions::at(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
}

// ── Mock collaborators ───────────────────────────────────────────────────

/// Halves the token count and keeps the first half of the text.
struct HalvingCompressor;

#[async_trait::async_trait]
impl Compressor for HalvingCompressor {
    fn name(&self) -> &str {
        "halving"
    }

    async fn compress(&self, segment: &Segment, _ratio: f64) -> Result<Segment, CompressError> {
        let keep = segment.content().chars().count() / 2;
        let half: String = segment.content().chars().take(keep).collect();
        Ok(segment
            .with_content(half)
            .with_token_count(segment.token_count() / 2))
    }
}

/// Rejects any segment containing the word "forbidden".
struct RejectingSanitizer;

impl Sanitizer for RejectingSanitizer {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn sanitize(&self, segment: Segment) -> Result<Segment, SanitizeError> {
        if segment.content().contains("forbidden") {
            return Err(SanitizeError::Rejected {
                segment_id: segment.id().clone(),
                sanitizer: self.name().into(),
                reason: "forbidden content".into(),
            });
        }
        Ok(segment)
    }
}

#[derive(Default)]
struct CollectingSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditSink for CollectingSink {
    fn record(&self, entry: &AuditEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_elastic_share_exhausted() {
    let pipeline = Pipeline::builder().policy(scenario_a_policy()).build().unwrap();
    let package = pipeline
        .build(scenario_a_segments(), BuildOptions::default())
        .await
        .unwrap();

    assert_eq!(ids(&package.segments), vec!["sys", "rag-3"]);
    assert_eq!(package.usage.total_tokens, 58);
    assert_eq!(package.usage.available_tokens, 100);
    assert!((package.allocation.saturation_rate - 0.58).abs() < 1e-12);

    let dropped: Vec<(&str, ReasonCode, StageKind, usize)> = package
        .dropped
        .iter()
        .map(|d| (d.id.as_str(), d.reason_code, d.stage, d.tokens))
        .collect();
    assert_eq!(
        dropped,
        vec![
            ("rag-2", ReasonCode::ElasticShareExhausted, StageKind::Allocate, 40),
            ("rag-1", ReasonCode::ElasticShareExhausted, StageKind::Allocate, 40),
        ]
    );
}

#[tokio::test]
async fn scenario_b_oversized_must_keep_fails_naming_it() {
    let pipeline = Pipeline::builder().policy(scenario_a_policy()).build().unwrap();
    let segments = vec![
        seg("huge", SegmentType::Messages, "an enormous transcript", 150, 50).with_must_keep(true),
        seg("doc", SegmentType::Rag, "a small passage", 5, 30),
    ];
    let failure = pipeline
        .build(segments, BuildOptions::default())
        .await
        .unwrap_err();

    assert_eq!(failure.error.failed_stage(), Some(StageKind::Allocate));
    let named: Vec<&str> = failure.error.segment_ids().iter().map(|id| id.as_str()).collect();
    assert_eq!(named, vec!["huge"]);
    assert!(matches!(
        failure.error,
        Error::Stage {
            source: StageError::Budget(BudgetError::MustKeepExceeded { .. }),
            ..
        }
    ));
    assert!(failure.audit.for_stage(StageKind::Allocate).next().is_none());
}

#[tokio::test]
async fn scenario_c_duplicate_keeps_higher_priority() {
    let pipeline = Pipeline::builder().build().unwrap();
    let segments = vec![
        seg("low", SegmentType::Rag, "the same retrieved passage", 6, 10),
        seg("high", SegmentType::Rag, "the same retrieved passage", 6, 20),
    ];
    let package = pipeline.build(segments, BuildOptions::default()).await.unwrap();

    assert_eq!(ids(&package.segments), vec!["high"]);
    assert_eq!(package.dropped.len(), 1);
    assert_eq!(package.dropped[0].id.as_str(), "low");
    assert_eq!(package.dropped[0].reason_code, ReasonCode::Duplicate);
    assert_eq!(package.dropped[0].stage, StageKind::Rerank);
}

#[tokio::test]
async fn scenario_d_error_strategy_lists_unadmitted() {
    let pipeline = Pipeline::builder()
        .policy(scenario_a_policy().overflow(OverflowStrategy::Error))
        .build()
        .unwrap();
    let failure = pipeline
        .build(scenario_a_segments(), BuildOptions::default())
        .await
        .unwrap_err();

    match &failure.error {
        Error::Stage {
            stage: StageKind::Allocate,
            source: StageError::Budget(BudgetError::Overflow { segment_ids, .. }),
        } => {
            assert_eq!(
                segment_ids,
                &vec![SegmentId::from("rag-2"), SegmentId::from("rag-1")]
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// ── Properties ───────────────────────────────────────────────────────────

fn mixed_segments() -> Vec<Segment> {
    let types = [
        SegmentType::Rag,
        SegmentType::Messages,
        SegmentType::Extra,
        SegmentType::System,
        SegmentType::Rag,
    ];
    let mut segments: Vec<Segment> = (0..30)
        .map(|i| {
            let segment_type = types[i % types.len()];
            seg(
                &format!("seg-{i}"),
                segment_type,
                &format!("segment {i} about topic{i}"),
                5 + (i * 7) % 23,
                ((i * 13) % 17) as i64,
            )
        })
        .collect();
    segments.push(
        seg("anchor", SegmentType::Messages, "the user's latest question", 10, 0)
            .with_must_keep(true),
    );
    segments
}

#[tokio::test]
async fn final_tokens_never_exceed_available() {
    let strategies = [
        OverflowStrategy::TruncateLowestPriority,
        OverflowStrategy::Compress,
        OverflowStrategy::Error,
    ];
    for (window, reserved) in [(120, 20), (300, 50), (600, 60), (2_000, 200)] {
        for strategy in strategies {
            let policy = BudgetPolicy::with_window(window, reserved)
                .rigid(SegmentType::System, 30)
                .elastic(SegmentType::Rag, 0.5)
                .elastic(SegmentType::Messages, 0.3)
                .overflow(strategy);
            let pipeline = Pipeline::builder().policy(policy).build().unwrap();
            let available = window - reserved;

            match pipeline.build(mixed_segments(), BuildOptions::default()).await {
                Ok(package) => {
                    let total: usize = package.segments.iter().map(|s| s.token_count()).sum();
                    assert_eq!(total, package.usage.total_tokens);
                    assert!(
                        total <= available,
                        "{strategy:?} at window {window}: {total} > {available}"
                    );
                    assert!(package.contains(&SegmentId::from("anchor")));
                }
                Err(failure) => {
                    assert_eq!(strategy, OverflowStrategy::Error, "{:?}", failure.error);
                    assert!(matches!(
                        failure.error,
                        Error::Stage {
                            stage: StageKind::Allocate,
                            source: StageError::Budget(BudgetError::Overflow { .. }),
                        }
                    ));
                }
            }
        }
    }
}

#[tokio::test]
async fn every_drop_has_one_reasoned_entry() {
    let policy = BudgetPolicy::with_window(300, 50)
        .rigid(SegmentType::System, 30)
        .elastic(SegmentType::Rag, 0.5)
        .elastic(SegmentType::Messages, 0.3);
    let pipeline = Pipeline::builder().policy(policy).build().unwrap();
    let package = pipeline
        .build(mixed_segments(), BuildOptions::default())
        .await
        .unwrap();

    assert!(!package.dropped.is_empty());
    for dropped in &package.dropped {
        assert!(!package.contains(&dropped.id));
        let drops: Vec<_> = package
            .audit
            .for_segment(&dropped.id)
            .filter(|e| e.decision == Decision::Drop)
            .collect();
        assert_eq!(drops.len(), 1, "{} dropped more than once", dropped.id);
        assert!(!drops[0].reason_detail.is_empty());
    }
    assert_eq!(package.segments.len() + package.dropped.len(), 31);
}

#[tokio::test]
async fn identical_input_produces_identical_audit() {
    let pipeline = Pipeline::builder().policy(scenario_a_policy()).build().unwrap();
    let first = pipeline.build(mixed_segments(), fixed_time()).await.unwrap();
    let second = pipeline.build(mixed_segments(), fixed_time()).await.unwrap();

    assert_eq!(first.audit, second.audit);
    assert_eq!(ids(&first.segments), ids(&second.segments));
    assert_eq!(first.reference_time, second.reference_time);
}

#[tokio::test]
async fn audit_sequence_starts_at_one_and_reaches_sinks() {
    let sink = Arc::new(CollectingSink::default());
    let pipeline = Pipeline::builder()
        .policy(scenario_a_policy())
        .audit_sink(sink.clone())
        .build()
        .unwrap();
    let package = pipeline
        .build(scenario_a_segments(), BuildOptions::default())
        .await
        .unwrap();

    let sequences: Vec<u64> = package.audit.entries().iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=package.audit.len() as u64).collect();
    assert_eq!(sequences, expected);
    assert_eq!(*sink.entries.lock().unwrap(), package.audit.entries().to_vec());
}

#[tokio::test]
async fn targeted_build_hides_other_namespaces() {
    let segments = vec![
        seg("sys", SegmentType::System, "You are a planner.", 5, 100),
        seg("plan", SegmentType::Rag, "milestones for the release", 10, 5)
            .with_visibility("planning"),
        seg("exec", SegmentType::Rag, "shell history from the executor", 10, 5)
            .with_visibility("execution"),
    ];
    let pipeline = Pipeline::builder().policy(scenario_a_policy()).build().unwrap();

    let package = pipeline
        .build(segments.clone(), fixed_time().with_namespace("planning"))
        .await
        .unwrap();
    assert_eq!(ids(&package.segments), vec!["sys", "plan"]);
    assert_eq!(package.dropped.len(), 1);
    assert_eq!(package.dropped[0].id.as_str(), "exec");
    assert_eq!(package.dropped[0].reason_code, ReasonCode::NamespaceHidden);
    assert_eq!(package.dropped[0].stage, StageKind::Rerank);

    let package = pipeline.build(segments, fixed_time()).await.unwrap();
    assert_eq!(package.segments.len(), 3);
}

// ── Failure paths ────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_build_stops_before_first_stage() {
    let pipeline = Pipeline::builder().build().unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let failure = pipeline
        .build(scenario_a_segments(), BuildOptions::default().with_cancel(cancel))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        Error::Cancelled {
            before: StageKind::Normalize
        }
    ));
    assert!(failure.audit.is_empty());
}

#[tokio::test]
async fn sanitizer_failure_keeps_earlier_audit() {
    let pipeline = Pipeline::builder()
        .sanitizer(Box::new(RejectingSanitizer))
        .build()
        .unwrap();
    let segments = vec![
        seg("clean", SegmentType::Rag, "hidden\u{200B}marker", 3, 30),
        seg("bad", SegmentType::Rag, "forbidden words", 3, 30),
    ];
    let failure = pipeline
        .build(segments, BuildOptions::default())
        .await
        .unwrap_err();

    assert_eq!(failure.error.failed_stage(), Some(StageKind::Sanitize));
    let named: Vec<&str> = failure.error.segment_ids().iter().map(|id| id.as_str()).collect();
    assert_eq!(named, vec!["bad"]);
    assert_eq!(failure.audit.len(), 1);
    assert_eq!(failure.audit.entries()[0].stage, StageKind::Normalize);
    assert_eq!(failure.audit.entries()[0].reason_code, ReasonCode::ContentNormalized);
}

// ── Compression gate ─────────────────────────────────────────────────────

#[tokio::test]
async fn saturation_gate_compresses_lowest_priority() {
    let pipeline = Pipeline::builder()
        .policy(BudgetPolicy::with_window(100, 0).elastic(SegmentType::Rag, 1.0))
        .register_compressor(Arc::new(HalvingCompressor))
        .compressor("halving")
        .build()
        .unwrap();
    let segments = vec![
        seg("rag-high", SegmentType::Rag, "primary source document", 50, 5),
        seg("rag-low", SegmentType::Rag, "secondary background notes", 40, 1),
    ];
    let package = pipeline.build(segments, BuildOptions::default()).await.unwrap();

    assert_eq!(package.usage.total_tokens, 70);
    assert_eq!(package.allocation.tokens_used, 70);
    assert_eq!(
        package.allocation.per_type[&SegmentType::Rag].compression_saved,
        20
    );
    assert!(package.dropped.is_empty());
    assert!(!package.warnings.is_empty());

    let entry = package
        .audit
        .for_stage(StageKind::Compress)
        .next()
        .unwrap();
    assert_eq!(entry.segment_id.as_str(), "rag-low");
    assert_eq!(entry.decision, Decision::Compress);
    assert_eq!(entry.reason_code, ReasonCode::SaturationRelief);
    assert_eq!((entry.tokens_before, entry.tokens_after), (Some(40), Some(20)));
}

#[tokio::test]
async fn disabled_gate_leaves_saturation_alone() {
    let pipeline = Pipeline::builder()
        .policy(BudgetPolicy::with_window(100, 0).elastic(SegmentType::Rag, 1.0))
        .compression(false)
        .build()
        .unwrap();
    let segments = vec![
        seg("rag-high", SegmentType::Rag, "primary source document", 50, 5),
        seg("rag-low", SegmentType::Rag, "secondary background notes", 40, 1),
    ];
    let package = pipeline.build(segments, BuildOptions::default()).await.unwrap();
    assert_eq!(package.usage.total_tokens, 90);
    assert!(package.audit.for_stage(StageKind::Compress).next().is_none());
}

// ── Configuration ────────────────────────────────────────────────────────

#[tokio::test]
async fn pipeline_from_toml_config() {
    let toml = r#"
[budget]
total_window_tokens = 100
reserved_output_tokens = 0
rigid_tokens = { system = 20 }
elastic_ratios = { rag = 0.5, messages = 0.5 }

[compress]
enabled = false
"#;
    let config = ForgeConfig::parse(toml, std::path::Path::new("inline.toml")).unwrap();
    let pipeline = Pipeline::from_config(&config).unwrap();
    let package = pipeline
        .build(scenario_a_segments(), BuildOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&package.segments), vec!["sys", "rag-3"]);
}
