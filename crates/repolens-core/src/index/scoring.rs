//! Similarity scoring helpers for fingerprint ranking.

use std::collections::BTreeMap;

/// Cosine similarity of two dense vectors. Zero when either is all zeros or
/// the lengths differ.
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    finite_or_zero(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Cosine similarity of two sparse token-weight maps.
pub fn token_cosine(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(token, w)| large.get(token).map(|v| w * v))
        .sum();
    let norm_a: f64 = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    finite_or_zero(dot / (norm_a * norm_b))
}

/// Weighted blend of structural and topical similarity.
pub fn blended_score(structural: f64, topical: f64, vector_weight: f64, token_weight: f64) -> f64 {
    finite_or_zero((structural * vector_weight) + (topical * token_weight))
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
