//! Segment domain types.
//!
//! A [`Segment`] is the atomic unit of context, such as a system prompt or a
//! retrieved passage. Segments are value objects: every `with_*` method
//! returns a new segment that keeps the original [`SegmentId`], so audit
//! entries recorded at any stage can be tied back to the fragment the caller
//! supplied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Stable identity of a segment across every transformation in a build.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub String);

impl SegmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of content a segment carries.
///
/// Declaration order is the canonical type order used for every type-level
/// tie break (remainder assignment, donor order during bidding, layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    /// System instructions
    System,
    /// Few-shot examples
    FewShot,
    /// Tool specifications
    Tools,
    /// Conversation turns
    Messages,
    /// Retrieved passages
    Rag,
    /// State variables
    State,
    /// Anything else
    Extra,
}

impl SegmentType {
    /// All types in canonical order.
    pub const ALL: [SegmentType; 7] = [
        SegmentType::System,
        SegmentType::FewShot,
        SegmentType::Tools,
        SegmentType::Messages,
        SegmentType::Rag,
        SegmentType::State,
        SegmentType::Extra,
    ];

    /// Priority assigned when the caller does not set one.
    pub fn default_priority(self) -> i64 {
        match self {
            Self::System => 100,
            Self::Tools => 80,
            Self::FewShot => 60,
            Self::State => 50,
            Self::Messages => 40,
            Self::Rag => 30,
            Self::Extra => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::FewShot => "few_shot",
            Self::Tools => "tools",
            Self::Messages => "messages",
            Self::Rag => "rag",
            Self::State => "state",
            Self::Extra => "extra",
        }
    }
}

impl std::fmt::Display for SegmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque per-segment metadata supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Relevance score from retrieval or an upstream reranker (0.0–1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,

    /// Externally computed embedding, used for diversity selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Where the content came from (document id, URL, tool name...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<serde_json::Value>,

    /// Namespace the segment is restricted to. `None` is visible to every
    /// build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,

    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// An immutable unit of context content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    id: SegmentId,
    segment_type: SegmentType,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_count: Option<usize>,
    priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl: Option<Duration>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    must_keep: bool,
    #[serde(default)]
    ordinal: usize,
    #[serde(default)]
    metadata: SegmentMetadata,
}

impl Segment {
    /// Create a segment with a fresh id and the type's default priority.
    pub fn new(content: impl Into<String>, segment_type: SegmentType) -> Self {
        Self {
            id: SegmentId::new(),
            segment_type,
            content: content.into(),
            token_count: None,
            priority: segment_type.default_priority(),
            ttl: None,
            created_at: Utc::now(),
            must_keep: false,
            ordinal: 0,
            metadata: SegmentMetadata::default(),
        }
    }

    /// Shorthand for a system segment.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(content, SegmentType::System)
    }

    /// Shorthand for a retrieved passage.
    pub fn rag(content: impl Into<String>) -> Self {
        Self::new(content, SegmentType::Rag)
    }

    /// Shorthand for a conversation turn.
    pub fn message(content: impl Into<String>) -> Self {
        Self::new(content, SegmentType::Messages)
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn segment_type(&self) -> SegmentType {
        self.segment_type
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Token cost, or 0 when the segment has not been counted yet.
    pub fn token_count(&self) -> usize {
        self.token_count.unwrap_or(0)
    }

    pub fn is_counted(&self) -> bool {
        self.token_count.is_some()
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn must_keep(&self) -> bool {
        self.must_keep
    }

    /// Position in the build's input list.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn metadata(&self) -> &SegmentMetadata {
        &self.metadata
    }

    /// Relevance used by diversity selection; missing scores count as 0.
    pub fn relevance(&self) -> f64 {
        self.metadata.relevance.unwrap_or(0.0)
    }

    /// Whether the TTL has run out at `reference_time`.
    ///
    /// Segments without a TTL never expire.
    pub fn is_expired(&self, reference_time: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        // A TTL past chrono's representable range never runs out.
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .is_some_and(|end| end <= reference_time)
    }

    // ── Copy-on-write updates ────────────────────────────────────────────

    /// New content under the same identity. The token count is cleared
    /// because it no longer describes the content.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            token_count: None,
            ..self.clone()
        }
    }

    pub fn with_token_count(&self, token_count: usize) -> Self {
        Self {
            token_count: Some(token_count),
            ..self.clone()
        }
    }

    pub fn with_priority(&self, priority: i64) -> Self {
        Self {
            priority,
            ..self.clone()
        }
    }

    pub fn with_ttl(&self, ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..self.clone()
        }
    }

    pub fn with_created_at(&self, created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            ..self.clone()
        }
    }

    pub fn with_must_keep(&self, must_keep: bool) -> Self {
        Self {
            must_keep,
            ..self.clone()
        }
    }

    pub fn with_ordinal(&self, ordinal: usize) -> Self {
        Self {
            ordinal,
            ..self.clone()
        }
    }

    pub fn with_metadata(&self, metadata: SegmentMetadata) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    pub fn with_relevance(&self, relevance: f64) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.relevance = Some(relevance);
        self.with_metadata(metadata)
    }

    pub fn with_embedding(&self, embedding: Vec<f32>) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.embedding = Some(embedding);
        self.with_metadata(metadata)
    }

    pub fn with_visibility(&self, namespace: impl Into<String>) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.visibility = Some(namespace.into());
        self.with_metadata(metadata)
    }

    /// Whether a build targeting `namespace` may see this segment. Builds
    /// without a target see everything.
    pub fn is_visible_to(&self, namespace: Option<&str>) -> bool {
        match (namespace, self.metadata.visibility.as_deref()) {
            (Some(target), Some(own)) => target == own,
            _ => true,
        }
    }

    /// Replace the id. Only meant for callers constructing their inputs;
    /// pipeline stages never call this.
    pub fn with_id(&self, id: SegmentId) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }
}

/// Order used by every ranking decision: priority descending, then earliest
/// insertion first.
pub fn rank_order(a: &Segment, b: &Segment) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.ordinal.cmp(&b.ordinal))
}
