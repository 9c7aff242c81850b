//! Token estimation
//!
//! The budget math runs on a fast character-class heuristic: dense scripts (CJK,
//! kana, hangul) at ~1.5 characters per token, everything else at ~4.
//! `Cl100kEstimator` gives exact cl100k_base counts for hosts that want them.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Characters per token for dense scripts
const DENSE_CHARS_PER_TOKEN: f64 = 1.5;
/// Characters per token for everything else
const OTHER_CHARS_PER_TOKEN: f64 = 4.0;

/// Maps text to an approximate token count
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Character-class heuristic used by default for all budget math
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> u32 {
        estimate_tokens(text)
    }
}

/// Estimate tokens, weighting dense-script characters more heavily
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let (dense, other) = text.chars().fold((0u64, 0u64), |(dense, other), c| {
        if is_dense_script(c) {
            (dense + 1, other)
        } else {
            (dense, other + 1)
        }
    });

    (dense as f64 / DENSE_CHARS_PER_TOKEN + other as f64 / OTHER_CHARS_PER_TOKEN).ceil() as u32
}

fn is_dense_script(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F     // CJK symbols and punctuation
        | 0x3040..=0x309F   // Hiragana
        | 0x30A0..=0x30FF   // Katakana
        | 0x3400..=0x4DBF   // CJK extension A
        | 0x4E00..=0x9FFF   // CJK unified ideographs
        | 0xAC00..=0xD7AF   // Hangul syllables
        | 0xF900..=0xFAFF   // CJK compatibility ideographs
        | 0xFF00..=0xFFEF   // Half/full-width forms
        | 0x20000..=0x2A6DF // CJK extension B
    )
}

/// Cache for token counts, keyed by content hash
struct TokenCache {
    cache: HashMap<u64, u32>,
    max_size: usize,
}

impl TokenCache {
    fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size),
            max_size,
        }
    }

    fn get(&self, hash: u64) -> Option<u32> {
        self.cache.get(&hash).copied()
    }

    fn insert(&mut self, hash: u64, count: u32) {
        // At capacity, clear half the cache
        if self.cache.len() >= self.max_size {
            let keys_to_remove: Vec<_> = self.cache.keys().take(self.max_size / 2).copied().collect();
            for key in keys_to_remove {
                self.cache.remove(&key);
            }
        }
        self.cache.insert(hash, count);
    }
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Exact cl100k_base counting with a per-instance cache.
///
/// Falls back to the heuristic when the BPE tables cannot be loaded.
pub struct Cl100kEstimator {
    bpe: Option<CoreBPE>,
    cache: RwLock<TokenCache>,
}

impl Cl100kEstimator {
    pub fn new() -> Self {
        Self::with_cache_size(10_000)
    }

    pub fn with_cache_size(max_entries: usize) -> Self {
        Self {
            bpe: cl100k_base().ok(),
            cache: RwLock::new(TokenCache::new(max_entries.max(2))),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.read().cache.len()
    }
}

impl Default for Cl100kEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator for Cl100kEstimator {
    fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let Some(bpe) = &self.bpe else {
            return estimate_tokens(text);
        };

        let content_hash = hash_content(text);
        if let Some(count) = self.cache.read().get(content_hash) {
            return count;
        }

        let count = bpe.encode_with_special_tokens(text).len() as u32;
        self.cache.write().insert(content_hash, count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_latin() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(400)), 100);
    }

    #[test]
    fn test_estimate_cjk_weighted() {
        // 3 ideographs at 1.5 chars per token
        assert_eq!(estimate_tokens("日本語"), 2);
        assert_eq!(estimate_tokens(&"中".repeat(300)), 200);
        assert!(estimate_tokens(&"中".repeat(100)) > estimate_tokens(&"a".repeat(100)));
    }

    #[test]
    fn test_estimate_mixed() {
        // 3 dense (2.0) + 4 other (1.0)
        assert_eq!(estimate_tokens("日本語abcd"), 3);
    }

    #[test]
    fn test_cl100k_counts_and_caches() {
        let estimator = Cl100kEstimator::new();
        assert_eq!(estimator.estimate(""), 0);

        let text = "This is a test sentence for caching.";
        let first = estimator.estimate(text);
        let second = estimator.estimate(text);
        assert_eq!(first, second);
        assert!(first > 0 && first < 20);
    }

    #[test]
    fn test_cache_evicts_half_when_full() {
        let mut cache = TokenCache::new(4);
        for i in 0..4 {
            cache.insert(i, i as u32);
        }
        cache.insert(99, 1);
        assert_eq!(cache.cache.len(), 3);
        assert_eq!(cache.get(99), Some(1));
    }
}
