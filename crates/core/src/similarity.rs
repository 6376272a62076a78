//! Pairwise similarity used by diversity selection.
//!
//! Scores are in `[0.0, 1.0]`. With embeddings on both sides we use cosine
//! similarity (negative values clamp to 0); otherwise we fall back to
//! word-set Jaccard overlap so the rerank stage works without an embedding
//! model.

use crate::segment::Segment;
use std::collections::HashSet;

/// Similarity between two segments, in `[0.0, 1.0]`.
pub trait Similarity: Send + Sync {
    fn name(&self) -> &str;

    fn similarity(&self, a: &Segment, b: &Segment) -> f64;
}

/// Cosine over embeddings when both have one; lexical Jaccard otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingSimilarity;

impl Similarity for EmbeddingSimilarity {
    fn name(&self) -> &str {
        "embedding_or_jaccard"
    }

    fn similarity(&self, a: &Segment, b: &Segment) -> f64 {
        match (&a.metadata().embedding, &b.metadata().embedding) {
            (Some(ea), Some(eb)) if ea.len() == eb.len() && !ea.is_empty() => {
                cosine_similarity(ea, eb).clamp(0.0, 1.0)
            }
            _ => jaccard_similarity(a.content(), b.content()),
        }
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1.0, 1.0]. Mismatched lengths, empty input or a
/// zero vector yield 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f64, 0.0f64, 0.0f64), |acc, (x, y)| {
        let (x, y) = (f64::from(*x), f64::from(*y));
        (acc.0 + x * y, acc.1 + x * x, acc.2 + y * y)
    });

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    dot / denom
}

/// Jaccard overlap of lowercase alphanumeric word sets.
///
/// Two empty texts are identical (1.0); one empty text shares nothing (0.0).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let wa = words(a);
    let wb = words(b);
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}
