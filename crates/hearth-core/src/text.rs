//! Word-overlap similarity
//!
//! Cheap lexical duplicate detection used wherever embeddings are not worth
//! the round trip: scheduled-item dedup, gap-pipeline proposals, cascade
//! expiry on memory deletion, keyword-search fallback.
//!
//! Text is normalized into a word set (lowercased, punctuation stripped,
//! stop-words removed). Two texts match when either threshold holds:
//! - strict: intersection covers >= 80% of the smaller set
//! - lenient: intersection covers >= 40% of each set

use std::collections::BTreeSet;

/// Strict threshold, fraction of the smaller set
pub const STRICT_OVERLAP: f64 = 0.8;

/// Lenient threshold, fraction of each set
pub const LENIENT_OVERLAP: f64 = 0.4;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "again", "all", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "before", "being", "both", "but", "by", "can", "could", "did", "do", "does", "for",
    "from", "had", "has", "have", "he", "her", "him", "his", "how", "i", "if", "in", "into", "is",
    "it", "its", "just", "me", "my", "of", "on", "or", "our", "she", "so", "some", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "to", "up", "us", "was", "we",
    "were", "what", "when", "which", "who", "will", "with", "would", "you", "your",
];

/// Normalize text into its significant word set
pub fn normalize_words(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Overlap between two word sets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overlap {
    pub intersection: usize,
    pub left: usize,
    pub right: usize,
}

impl Overlap {
    /// Intersection as a fraction of the smaller set (1.0 identical, 0.0 disjoint)
    pub fn score(&self) -> f64 {
        let smaller = self.left.min(self.right);
        if smaller == 0 {
            return 0.0;
        }
        self.intersection as f64 / smaller as f64
    }

    pub fn is_strict_match(&self) -> bool {
        self.left > 0 && self.right > 0 && self.score() >= STRICT_OVERLAP
    }

    pub fn is_lenient_match(&self) -> bool {
        if self.left == 0 || self.right == 0 {
            return false;
        }
        let i = self.intersection as f64;
        i >= LENIENT_OVERLAP * self.left as f64 && i >= LENIENT_OVERLAP * self.right as f64
    }

    pub fn is_duplicate(&self) -> bool {
        self.is_strict_match() || self.is_lenient_match()
    }
}

/// Compare two already-normalized word sets
pub fn overlap_sets(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Overlap {
    Overlap {
        intersection: a.intersection(b).count(),
        left: a.len(),
        right: b.len(),
    }
}

/// Compare two raw texts
pub fn word_overlap(a: &str, b: &str) -> Overlap {
    overlap_sets(&normalize_words(a), &normalize_words(b))
}

/// Whether two texts describe the same thing by word overlap
pub fn is_duplicate(a: &str, b: &str) -> bool {
    word_overlap(a, b).is_duplicate()
}

/// Turn free text into a safe FTS5 MATCH expression.
///
/// Every significant word is quoted and OR-ed, so user input can never be
/// interpreted as FTS5 syntax.
pub fn sanitize_fts5_query(query: &str) -> String {
    let words = normalize_words(query);
    if words.is_empty() {
        // Matches nothing rather than erroring on an empty MATCH
        return "\"\"".to_string();
    }
    words
        .iter()
        .map(|w| format!("\"{}\"", w.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}
