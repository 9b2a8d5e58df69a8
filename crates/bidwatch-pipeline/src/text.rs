//! Term-frequency vectors shared by the classifier and the dedup linker.

use std::collections::HashMap;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "of", "on", "or",
    "per", "shall", "that", "the", "this", "to", "will", "with",
];

/// Lowercase alphanumeric terms, stopwords and single characters dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| term.len() >= 2)
        .map(str::to_lowercase)
        .filter(|term| !STOPWORDS.contains(&term.as_str()))
        .collect()
}

/// Sparse L2-normalized term-frequency vector.
pub fn term_vector(text: &str) -> HashMap<String, f64> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return HashMap::new();
    }

    let mut tf: HashMap<String, f64> = HashMap::new();
    for token in tokens {
        *tf.entry(token).or_default() += 1.0;
    }

    let norm: f64 = tf.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        for value in tf.values_mut() {
            *value /= norm;
        }
    }
    tf
}

/// Cosine similarity of two unit vectors (their dot product).
pub fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, weight)| large.get(term).map(|other| weight * other))
        .sum()
}
