//! Trigram string similarity
//!
//! Words are lowercased, padded with two leading blanks and one trailing blank, and
//! cut into three-character windows. Similarity is |shared| / |union| of the two
//! trigram sets, so it is symmetric and lies in [0, 1].

use std::collections::HashSet;

pub fn trigrams(text: &str) -> HashSet<String> {
    let mut set = HashSet::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  ".chars().chain(word.chars()).chain(" ".chars()).collect();
        for window in padded.windows(3) {
            set.insert(window.iter().collect());
        }
    }
    set
}

pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let left = trigrams(a);
    let right = trigrams(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.len() + right.len() - shared;
    shared as f64 / union as f64
}
