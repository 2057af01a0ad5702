//! Cosine-similarity nearest-neighbor matching against the gallery.

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult};

pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Cosine similarity computed by dividing by both norms explicitly — inputs
/// are not assumed to already be L2-normalized, even though `embed` always
/// produces normalized vectors in this codebase (spec.md §4.1: "the embed
/// step does normalize; but the cosine function must still divide by norms
/// so it remains correct if the contract is ever relaxed").
pub struct CosineMatcher;

impl CosineMatcher {
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let (best_id, best_score) = gallery.with_entries(|labels, embeddings| {
            let mut best_id = 0i64;
            let mut best_score = f32::MIN;
            for (label, entry) in labels.iter().zip(embeddings.iter()) {
                let score = Self::cosine_similarity(&probe.values, &entry.values);
                if score > best_score {
                    best_score = score;
                    best_id = *label;
                }
            }
            (best_id, best_score)
        });

        if best_score == f32::MIN {
            return MatchResult::no_match();
        }

        MatchResult {
            matched: best_score > threshold,
            enroll_id: best_id,
            score: best_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![0.6, 0.8];
        let sim = CosineMatcher::cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(CosineMatcher::cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_scale_invariant() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![2.0, 4.0, 6.0];
        let sim = CosineMatcher::cosine_similarity(&a, &b);
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_similarity_mismatched_length_is_zero() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 2.0, 3.0];
        assert_eq!(CosineMatcher::cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn compare_against_empty_gallery_is_no_match() {
        let gallery = Gallery::new();
        let probe = Embedding::new(vec![1.0, 0.0], "test");
        let result = CosineMatcher.compare(&probe, &gallery, 0.3);
        assert!(!result.matched);
    }

    #[test]
    fn compare_finds_best_of_several() {
        let gallery = Gallery::new();
        gallery.upsert(1, Embedding::new(vec![1.0, 0.0], "test"), "alice", true);
        gallery.upsert(2, Embedding::new(vec![0.0, 1.0], "test"), "bob", true);

        let probe = Embedding::new(vec![0.9, 0.1], "test");
        let result = CosineMatcher.compare(&probe, &gallery, 0.3);
        assert!(result.matched);
        assert_eq!(result.enroll_id, 1);
    }
}
