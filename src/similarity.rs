// 🔍 Similarity Functions - exact and fuzzy attribute comparison
//
// Pure functions shared by the matching engine. Fuzzy similarity is
// Jaro-Winkler over normalized text: symmetric, reflexive, and 0.0 for
// empty input (never an error).

use std::collections::BTreeSet;

/// Normalize free text for comparison: lowercase, alphanumerics only,
/// single spaces. "  JON   Smith-Jr " → "jon smithjr"
pub fn normalize_name(s: &str) -> String {
    let cleaned: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-insensitive, whitespace-normalized equality for identifier-bearing
/// fields. Empty input never matches anything.
pub fn exact_match(a: &str, b: &str) -> bool {
    let a = normalize_name(a);
    let b = normalize_name(b);
    !a.is_empty() && a == b
}

/// Fuzzy similarity in [0, 1] for free-text fields.
///
/// Contract: sim(a, b) == sim(b, a) and sim(a, a) == 1.0 for non-empty a.
/// Empty or whitespace-only input yields 0.0.
pub fn fuzzy_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::jaro_winkler(&a, &b)
}

/// Strip everything but digits. Used to compare phone numbers across
/// formatting variants ("+1 (555) 123-4567" vs "15551234567").
pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Jaccard overlap of two sets: |A ∩ B| / |A ∪ B|.
/// Two empty sets share nothing, so the overlap is 0.0 (not 1.0).
pub fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
