//! Rerank stage: namespace visibility, TTL expiry, exact dedup, MMR
//! diversity, priority sort.
//!
//! Every step is deterministic. Running the stage on its own output records
//! nothing and changes nothing.

use crate::stage::{Stage, StageOutput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctxforge_core::audit::{ReasonCode, StageJournal};
use ctxforge_core::context::BuildContext;
use ctxforge_core::error::StageError;
use ctxforge_core::rerank::RerankConfig;
use ctxforge_core::segment::{Segment, SegmentType, rank_order};
use ctxforge_core::similarity::Similarity;
use ctxforge_core::stage::StageKind;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct RerankStage {
    config: RerankConfig,
    similarity: Arc<dyn Similarity>,
}

impl RerankStage {
    pub fn new(config: RerankConfig, similarity: Arc<dyn Similarity>) -> Self {
        Self { config, similarity }
    }

    /// Drop segments restricted to a namespace other than the build's.
    /// must_keep segments are exempt.
    fn hide(
        &self,
        segments: Vec<Segment>,
        namespace: Option<&str>,
        journal: &mut StageJournal,
    ) -> Vec<Segment> {
        segments
            .into_iter()
            .filter(|s| {
                if s.must_keep() || s.is_visible_to(namespace) {
                    return true;
                }
                journal.drop(
                    s.id(),
                    ReasonCode::NamespaceHidden,
                    format!(
                        "visible to {} only, build targets {}",
                        s.metadata().visibility.as_deref().unwrap_or_default(),
                        namespace.unwrap_or_default()
                    ),
                );
                false
            })
            .collect()
    }

    /// Step 1: drop segments whose TTL ran out. must_keep segments never
    /// expire.
    fn expire(
        &self,
        segments: Vec<Segment>,
        reference_time: DateTime<Utc>,
        journal: &mut StageJournal,
    ) -> Vec<Segment> {
        segments
            .into_iter()
            .filter(|s| {
                if s.must_keep() || !s.is_expired(reference_time) {
                    return true;
                }
                journal.drop(
                    s.id(),
                    ReasonCode::TtlExpired,
                    format!("created {} with ttl {:?}", s.created_at().to_rfc3339(), s.ttl()),
                );
                false
            })
            .collect()
    }

    /// Step 2: exact-content dedup within a type. A must_keep instance wins
    /// its group, otherwise the best-ranked one does. Other must_keep
    /// instances stay.
    fn dedup(&self, segments: Vec<Segment>, journal: &mut StageJournal) -> Vec<Segment> {
        let beats = |a: &Segment, b: &Segment| {
            b.must_keep()
                .cmp(&a.must_keep())
                .then_with(|| rank_order(a, b))
                .is_lt()
        };
        let mut winners: HashMap<(SegmentType, &str), usize> = HashMap::new();
        for (i, s) in segments.iter().enumerate() {
            winners
                .entry((s.segment_type(), s.content()))
                .and_modify(|w| {
                    if beats(s, &segments[*w]) {
                        *w = i;
                    }
                })
                .or_insert(i);
        }
        let winner_of: Vec<usize> = segments
            .iter()
            .map(|s| winners[&(s.segment_type(), s.content())])
            .collect();
        let winner_ids: Vec<String> = winner_of
            .iter()
            .map(|&w| segments[w].id().to_string())
            .collect();

        segments
            .into_iter()
            .enumerate()
            .filter(|(i, s)| {
                if winner_of[*i] == *i || s.must_keep() {
                    return true;
                }
                journal.drop(
                    s.id(),
                    ReasonCode::Duplicate,
                    format!("same content as {}", winner_ids[*i]),
                );
                false
            })
            .map(|(_, s)| s)
            .collect()
    }

    /// Step 3: maximal-marginal-relevance selection per diversity type.
    fn diversify(&self, segments: Vec<Segment>, journal: &mut StageJournal) -> Vec<Segment> {
        let lambda = self.config.mmr_lambda;
        let threshold = self.config.similarity_threshold;
        let mut dropped: HashSet<usize> = HashSet::new();

        for segment_type in SegmentType::ALL {
            if !self.config.is_diversity_type(segment_type) {
                continue;
            }
            let members: Vec<usize> = (0..segments.len())
                .filter(|&i| segments[i].segment_type() == segment_type)
                .collect();
            if members.is_empty() {
                continue;
            }

            let mut selected: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| segments[i].must_keep())
                .collect();
            let mut candidates: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| !segments[i].must_keep())
                .collect();
            candidates.sort_by_key(|&i| segments[i].ordinal());

            // candidate -> (max similarity to the selection, closest selected)
            let mut nearest: HashMap<usize, (f64, usize)> = HashMap::new();
            for &c in &candidates {
                for &s in &selected {
                    self.observe(&segments, &mut nearest, c, s);
                }
            }

            while !candidates.is_empty() {
                candidates.retain(|c| match nearest.get(c) {
                    Some(&(sim, closest)) if sim > threshold => {
                        journal.drop(
                            segments[*c].id(),
                            ReasonCode::NearDuplicate,
                            format!(
                                "similarity {sim:.3} to {} exceeds {threshold}",
                                segments[closest].id()
                            ),
                        );
                        dropped.insert(*c);
                        false
                    }
                    _ => true,
                });
                if candidates.is_empty() {
                    break;
                }

                if let Some(cap) = self.config.max_per_type
                    && selected.len() >= cap
                {
                    for &c in &candidates {
                        journal.drop(
                            segments[c].id(),
                            ReasonCode::DiversityLimit,
                            format!("{segment_type} already has {cap} diverse segments"),
                        );
                        dropped.insert(c);
                    }
                    break;
                }

                let mut best: Option<(usize, f64)> = None;
                for (pos, &c) in candidates.iter().enumerate() {
                    let relevance = segments[c].relevance();
                    let score = if selected.is_empty() {
                        relevance
                    } else {
                        let max_sim = nearest.get(&c).map(|&(sim, _)| sim).unwrap_or(0.0);
                        lambda * relevance - (1.0 - lambda) * max_sim
                    };
                    if best.is_none_or(|(_, top)| score > top) {
                        best = Some((pos, score));
                    }
                }
                let Some((pos, _)) = best else {
                    break;
                };
                let pick = candidates.remove(pos);
                selected.push(pick);
                for &c in &candidates {
                    self.observe(&segments, &mut nearest, c, pick);
                }
            }
        }

        segments
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, s)| s)
            .collect()
    }

    fn observe(
        &self,
        segments: &[Segment],
        nearest: &mut HashMap<usize, (f64, usize)>,
        candidate: usize,
        selected: usize,
    ) {
        let sim = self
            .similarity
            .similarity(&segments[candidate], &segments[selected]);
        let entry = nearest.entry(candidate).or_insert((f64::MIN, selected));
        if sim > entry.0 {
            *entry = (sim, selected);
        }
    }

    /// Step 4: stable sort by (priority desc, ordinal asc).
    fn sort(&self, segments: Vec<Segment>, journal: &mut StageJournal) -> Vec<Segment> {
        let mut indexed: Vec<(usize, Segment)> = segments.into_iter().enumerate().collect();
        indexed.sort_by(|(_, a), (_, b)| rank_order(a, b));
        indexed
            .into_iter()
            .enumerate()
            .map(|(new_pos, (old_pos, s))| {
                if new_pos != old_pos {
                    journal.reorder(
                        s.id(),
                        ReasonCode::PrioritySort,
                        format!("moved from position {old_pos} to {new_pos} (priority {})", s.priority()),
                    );
                }
                s
            })
            .collect()
    }
}

#[async_trait]
impl Stage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &BuildContext,
    ) -> Result<StageOutput, StageError> {
        let mut journal = StageJournal::new();
        let input = segments.len();

        let segments = self.hide(segments, ctx.namespace(), &mut journal);
        let visible = segments.len();
        let segments = self.expire(segments, ctx.reference_time(), &mut journal);
        let after_ttl = segments.len();
        let segments = self.dedup(segments, &mut journal);
        let after_dedup = segments.len();
        let segments = self.diversify(segments, &mut journal);
        let after_mmr = segments.len();
        let segments = self.sort(segments, &mut journal);

        journal.note(
            "rerank.dropped",
            serde_json::json!({
                "namespace_hidden": input - visible,
                "ttl_expired": visible - after_ttl,
                "duplicate": after_ttl - after_dedup,
                "diversity": after_dedup - after_mmr,
            }),
        );
        tracing::debug!(
            input,
            output = segments.len(),
            similarity = self.similarity.name(),
            "Reranked segments"
        );
        Ok(StageOutput::new(segments, journal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::audit::{AuditLog, Decision};
    use ctxforge_core::segment::SegmentId;
    use ctxforge_core::similarity::EmbeddingSimilarity;
    use std::time::Duration;

    fn stage(config: RerankConfig) -> RerankStage {
        RerankStage::new(config, Arc::new(EmbeddingSimilarity))
    }

    fn rag(id: &str, content: &str, priority: i64, ordinal: usize) -> Segment {
        Segment::rag(content)
            .with_id(SegmentId::from(id))
            .with_priority(priority)
            .with_ordinal(ordinal)
            .with_token_count(10)
    }

    async fn run(stage: &RerankStage, segments: Vec<Segment>) -> (Vec<Segment>, AuditLog) {
        let out = stage
            .process(segments, &BuildContext::new(Utc::now()))
            .await
            .unwrap();
        let mut log = AuditLog::new();
        log.append(StageKind::Rerank, out.journal.into_parts().entries);
        (out.segments, log)
    }

    fn ids(segments: &[Segment]) -> Vec<&str> {
        segments.iter().map(|s| s.id().as_str()).collect()
    }

    #[tokio::test]
    async fn expired_segments_dropped_but_must_keep_survives() {
        let old = Utc::now() - chrono::Duration::hours(2);
        let segs = vec![
            rag("stale", "alpha", 30, 0)
                .with_created_at(old)
                .with_ttl(Duration::from_secs(60)),
            rag("pinned", "beta", 30, 1)
                .with_created_at(old)
                .with_ttl(Duration::from_secs(60))
                .with_must_keep(true),
            rag("fresh", "gamma", 30, 2).with_ttl(Duration::from_secs(3_600)),
        ];
        let (out, log) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["pinned", "fresh"]);
        let entry = log.for_segment(&SegmentId::from("stale")).next().unwrap();
        assert_eq!(entry.reason_code, ReasonCode::TtlExpired);
    }

    #[tokio::test]
    async fn other_namespaces_hidden_from_targeted_build() {
        let segs = vec![
            rag("shared", "alpha", 30, 0),
            rag("mine", "beta", 30, 1).with_visibility("planning"),
            rag("theirs", "gamma", 30, 2).with_visibility("execution"),
            rag("pinned", "delta", 30, 3)
                .with_visibility("execution")
                .with_must_keep(true),
        ];
        let ctx = BuildContext::new(Utc::now()).with_namespace(Some("planning".into()));
        let out = stage(RerankConfig::default())
            .process(segs.clone(), &ctx)
            .await
            .unwrap();
        assert_eq!(ids(&out.segments), vec!["shared", "mine", "pinned"]);
        let parts = out.journal.into_parts();
        let hidden: Vec<_> = parts
            .entries
            .iter()
            .filter(|e| e.reason_code == ReasonCode::NamespaceHidden)
            .collect();
        assert_eq!(hidden.len(), 1);
        assert_eq!(hidden[0].segment_id.as_str(), "theirs");
        assert_eq!(hidden[0].decision, Decision::Drop);
        assert_eq!(parts.metadata["rerank.dropped"]["namespace_hidden"], 1);

        // without a target namespace nothing is hidden
        let (out, _) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(out.len(), 4);
    }

    #[tokio::test]
    async fn exact_duplicates_keep_highest_priority() {
        let segs = vec![
            rag("low", "same passage", 10, 0),
            rag("high", "same passage", 50, 1),
        ];
        let (out, log) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["high"]);
        let entry = log.for_segment(&SegmentId::from("low")).next().unwrap();
        assert_eq!(entry.decision, Decision::Drop);
        assert_eq!(entry.reason_code, ReasonCode::Duplicate);
        assert!(entry.reason_detail.contains("high"));
    }

    #[tokio::test]
    async fn duplicate_tie_keeps_earliest() {
        let segs = vec![rag("first", "same", 30, 0), rag("second", "same", 30, 1)];
        let (out, _) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["first"]);
    }

    #[tokio::test]
    async fn same_content_different_type_is_not_duplicate() {
        let segs = vec![
            rag("doc", "hello", 30, 0),
            Segment::message("hello")
                .with_id(SegmentId::from("turn"))
                .with_ordinal(1),
        ];
        let (out, _) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn must_keep_duplicate_wins_its_group() {
        let segs = vec![
            rag("higher", "same", 50, 0),
            rag("pinned", "same", 10, 1).with_must_keep(true),
        ];
        let (out, log) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["pinned"]);
        let entry = log.for_segment(&SegmentId::from("higher")).next().unwrap();
        assert_eq!(entry.decision, Decision::Drop);
        assert_eq!(entry.reason_code, ReasonCode::Duplicate);
        assert!(entry.reason_detail.contains("pinned"));
        assert!(log.for_segment(&SegmentId::from("pinned")).next().is_none());
    }

    #[tokio::test]
    async fn several_must_keep_duplicates_all_stay() {
        let segs = vec![
            rag("loose", "same", 90, 0),
            rag("pin-a", "same", 10, 1).with_must_keep(true),
            rag("pin-b", "same", 20, 2).with_must_keep(true),
        ];
        let (out, log) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["pin-b", "pin-a"]);
        let entry = log.for_segment(&SegmentId::from("loose")).next().unwrap();
        assert_eq!(entry.reason_code, ReasonCode::Duplicate);
        assert!(entry.reason_detail.contains("pin-b"));
    }

    #[tokio::test]
    async fn near_duplicates_dropped_by_similarity() {
        let segs = vec![
            rag("a", "x", 30, 0).with_relevance(0.9).with_embedding(vec![1.0, 0.0]),
            rag("b", "y", 30, 1).with_relevance(0.8).with_embedding(vec![0.99, 0.05]),
            rag("c", "z", 30, 2).with_relevance(0.5).with_embedding(vec![0.0, 1.0]),
        ];
        let (out, log) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["a", "c"]);
        let entry = log.for_segment(&SegmentId::from("b")).next().unwrap();
        assert_eq!(entry.reason_code, ReasonCode::NearDuplicate);
        assert!(entry.reason_detail.contains(" a "));
    }

    #[tokio::test]
    async fn diversity_cap_drops_the_rest() {
        let config = RerankConfig {
            max_per_type: Some(2),
            ..Default::default()
        };
        let segs = vec![
            rag("a", "x", 30, 0).with_relevance(0.2).with_embedding(vec![1.0, 0.0, 0.0]),
            rag("b", "y", 30, 1).with_relevance(0.9).with_embedding(vec![0.0, 1.0, 0.0]),
            rag("c", "z", 30, 2).with_relevance(0.5).with_embedding(vec![0.0, 0.0, 1.0]),
        ];
        let (out, log) = run(&stage(config), segs).await;
        // b (most relevant) then c (next best score); a is over the cap
        assert_eq!(ids(&out), vec!["b", "c"]);
        let entry = log.for_segment(&SegmentId::from("a")).next().unwrap();
        assert_eq!(entry.reason_code, ReasonCode::DiversityLimit);
    }

    #[tokio::test]
    async fn mmr_seeds_selection_with_must_keep() {
        let segs = vec![
            rag("pinned", "x", 30, 0)
                .with_must_keep(true)
                .with_embedding(vec![1.0, 0.0]),
            rag("echo", "y", 30, 1)
                .with_relevance(1.0)
                .with_embedding(vec![1.0, 0.01]),
        ];
        let (out, _) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["pinned"]);
    }

    #[tokio::test]
    async fn mmr_disabled_keeps_near_duplicates() {
        let config = RerankConfig {
            enable_mmr: false,
            ..Default::default()
        };
        let segs = vec![
            rag("a", "x", 30, 0).with_embedding(vec![1.0, 0.0]),
            rag("b", "y", 30, 1).with_embedding(vec![1.0, 0.0]),
        ];
        let (out, _) = run(&stage(config), segs).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn mmr_only_applies_to_diversity_types() {
        let segs = vec![
            Segment::message("the same words here")
                .with_id(SegmentId::from("m1"))
                .with_ordinal(0),
            Segment::message("the same words here too")
                .with_id(SegmentId::from("m2"))
                .with_ordinal(1),
        ];
        let (out, _) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn sort_is_stable_and_audits_moves() {
        let segs = vec![
            rag("r1", "one", 30, 0),
            Segment::system("sys").with_id(SegmentId::from("sys")).with_ordinal(1),
            rag("r2", "two completely different", 30, 2),
        ];
        let (out, log) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["sys", "r1", "r2"]);
        let moved: Vec<&str> = log
            .entries()
            .iter()
            .filter(|e| e.decision == Decision::Reorder)
            .map(|e| e.segment_id.as_str())
            .collect();
        assert_eq!(moved, vec!["sys", "r1"]);
    }

    #[tokio::test]
    async fn rerank_is_idempotent() {
        let rerank = stage(RerankConfig {
            max_per_type: Some(2),
            ..Default::default()
        });
        let segs = vec![
            rag("a", "alpha beta", 30, 0).with_relevance(0.4),
            rag("b", "alpha beta", 20, 1),
            rag("c", "gamma delta", 30, 2).with_relevance(0.9),
            rag("d", "epsilon zeta", 30, 3).with_relevance(0.1),
            Segment::system("rules").with_id(SegmentId::from("s")).with_ordinal(4),
        ];
        let (first, first_log) = run(&rerank, segs).await;
        assert!(!first_log.is_empty());
        let (second, second_log) = run(&rerank, first.clone()).await;
        assert_eq!(second, first);
        assert!(second_log.is_empty());
    }

    #[tokio::test]
    async fn every_drop_has_exactly_one_entry() {
        let old = Utc::now() - chrono::Duration::days(1);
        let segs = vec![
            rag("dup", "same", 10, 0)
                .with_created_at(old)
                .with_ttl(Duration::from_secs(1)),
            rag("keep", "same", 30, 1),
        ];
        let (out, log) = run(&stage(RerankConfig::default()), segs).await;
        assert_eq!(ids(&out), vec!["keep"]);
        assert_eq!(log.for_segment(&SegmentId::from("dup")).count(), 1);
    }
}
