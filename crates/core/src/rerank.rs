//! Rerank stage settings.

use crate::error::PolicyError;
use crate::segment::SegmentType;
use serde::{Deserialize, Serialize};

/// Knobs for TTL/dedup/diversity reranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Run MMR diversity selection on `diversity_types`.
    #[serde(default = "default_true")]
    pub enable_mmr: bool,

    /// Relevance weight in the MMR score (1.0 = relevance only).
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f64,

    /// Candidates more similar than this to an already selected segment are
    /// dropped as near duplicates.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Maximum segments kept per diversity type (`None` = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_type: Option<usize>,

    #[serde(default = "default_diversity_types")]
    pub diversity_types: Vec<SegmentType>,
}

fn default_true() -> bool {
    true
}
fn default_mmr_lambda() -> f64 {
    0.7
}
fn default_similarity_threshold() -> f64 {
    0.85
}
fn default_diversity_types() -> Vec<SegmentType> {
    vec![SegmentType::Rag]
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enable_mmr: true,
            mmr_lambda: default_mmr_lambda(),
            similarity_threshold: default_similarity_threshold(),
            max_per_type: None,
            diversity_types: default_diversity_types(),
        }
    }
}

impl RerankConfig {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(0.0..=1.0).contains(&self.mmr_lambda) {
            return Err(PolicyError::OutOfRange {
                field: "mmr_lambda",
                range: "0.0..=1.0",
                value: self.mmr_lambda,
            });
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(PolicyError::OutOfRange {
                field: "similarity_threshold",
                range: "0.0..=1.0",
                value: self.similarity_threshold,
            });
        }
        Ok(())
    }

    pub fn is_diversity_type(&self, segment_type: SegmentType) -> bool {
        self.enable_mmr && self.diversity_types.contains(&segment_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_rag_only() {
        let config = RerankConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_diversity_type(SegmentType::Rag));
        assert!(!config.is_diversity_type(SegmentType::Messages));
    }

    #[test]
    fn disabled_mmr_covers_nothing() {
        let config = RerankConfig {
            enable_mmr: false,
            ..Default::default()
        };
        assert!(!config.is_diversity_type(SegmentType::Rag));
    }

    #[test]
    fn lambda_out_of_range_rejected() {
        let config = RerankConfig {
            mmr_lambda: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PolicyError::OutOfRange { field: "mmr_lambda", .. })
        ));
    }
}
