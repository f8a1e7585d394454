//! Shared text scoring helpers: tokenization and set overlap.
//!
//! Used by search ranking, feedback clustering, and recommendation scoring.

use std::collections::HashSet;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "have", "has",
    "had", "do", "does", "did", "will", "would", "could", "it", "its", "of",
    "in", "to", "for", "on", "at", "by", "with", "from", "this", "that", "and",
    "or", "but",
];

/// Lowercase, split on non-alphanumeric characters, and remove stop words.
pub(crate) fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|character: char| !character.is_alphanumeric())
        .filter(|token| !token.is_empty() && !STOP_WORDS.contains(token))
        .map(String::from)
        .collect()
}

/// Jaccard similarity between two token sets. Returns 0.0 when both sets are
/// empty to avoid division by zero.
pub(crate) fn jaccard(tokens_a: &HashSet<String>, tokens_b: &HashSet<String>) -> f64 {
    let intersection_size = tokens_a.intersection(tokens_b).count();
    let union_size = tokens_a.union(tokens_b).count();
    if union_size == 0 {
        return 0.0;
    }
    intersection_size as f64 / union_size as f64
}

/// Jaccard similarity between the token sets of two strings.
pub(crate) fn keyword_overlap(text_a: &str, text_b: &str) -> f64 {
    jaccard(&tokenize(text_a), &tokenize(text_b))
}
