//! Query normalization and lexical overlap.

use std::collections::HashSet;

/// Keywords kept from a query.
pub const MAX_KEYWORDS: usize = 5;

/// Lowercase, turn punctuation into spaces, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Distinct normalized words of `text`.
pub fn tokens(text: &str) -> HashSet<String> {
    normalize(text).split(' ').filter(|w| !w.is_empty()).map(String::from).collect()
}

/// Up to [`MAX_KEYWORDS`] distinct words longer than two characters that are
/// not plain numbers, in query order.
pub fn keywords(normalized_query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    normalized_query
        .split(' ')
        .filter(|w| w.chars().count() > 2 && !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| seen.insert(*w))
        .take(MAX_KEYWORDS)
        .map(String::from)
        .collect()
}

/// Fraction of `keywords` present among the words of `text`.
pub fn overlap(keywords: &[String], text: &str) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let words = tokens(text);
    let found = keywords.iter().filter(|k| words.contains(k.as_str())).count();
    found as f32 / keywords.len() as f32
}
