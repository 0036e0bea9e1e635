//! Tokenizer plugin interface
//!
//! Tokenization backends are external to the core; the pipeline only needs
//! `encode`, `decode`, and `count`. The built-in [`HeuristicTokenizer`]
//! treats whitespace-separated words as tokens against a fixed vocabulary,
//! which keeps synthetic prompt sizing and output counting deterministic
//! without pulling in a model-specific tokenizer. Counts from a heuristic
//! can differ substantially from a real tokenizer; wire in a proper backend
//! when absolute token counts matter.

use std::collections::HashMap;
use std::sync::Arc;

/// Tokenizer interface used by dataset synthesis and metric extraction
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token ids back into text
    fn decode(&self, ids: &[u32]) -> String;

    /// Count the tokens in the given text
    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Shared tokenizer handle
pub type TokenizerRef = Arc<dyn Tokenizer>;

/// Word-level tokenizer over a fixed vocabulary.
///
/// Words present in the vocabulary map to their index; unknown words hash
/// into the vocabulary range so `decode(encode(text))` stays total.
pub struct HeuristicTokenizer {
    vocab: Vec<String>,
    index: HashMap<String, u32>,
}

impl HeuristicTokenizer {
    /// Build a tokenizer from a reference text corpus
    pub fn from_corpus(corpus: &str) -> Self {
        let mut vocab = Vec::new();
        let mut index = HashMap::new();
        for word in corpus.split_whitespace() {
            if !index.contains_key(word) {
                index.insert(word.to_string(), vocab.len() as u32);
                vocab.push(word.to_string());
            }
        }
        assert!(!vocab.is_empty(), "tokenizer corpus must not be empty");
        Self { vocab, index }
    }

    /// Vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn fallback_id(&self, word: &str) -> u32 {
        // FNV-1a keeps unknown-word ids stable across runs and platforms
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in word.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x1000_0000_01b3);
        }
        (hash % self.vocab.len() as u64) as u32
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|word| {
                self.index
                    .get(word)
                    .copied()
                    .unwrap_or_else(|| self.fallback_id(word))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .map(|&id| self.vocab[id as usize % self.vocab.len()].as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> HeuristicTokenizer {
        HeuristicTokenizer::from_corpus("the quick brown fox jumps over the lazy dog")
    }

    #[test]
    fn test_encode_known_words() {
        let tok = tokenizer();
        assert_eq!(tok.encode("the quick"), vec![0, 1]);
        assert_eq!(tok.vocab_size(), 8); // "the" deduplicated
    }

    #[test]
    fn test_decode_round_trip() {
        let tok = tokenizer();
        let ids = tok.encode("quick brown fox");
        assert_eq!(tok.decode(&ids), "quick brown fox");
    }

    #[test]
    fn test_count_matches_words() {
        let tok = tokenizer();
        assert_eq!(tok.count("one two three"), 3);
        assert_eq!(tok.count("   spaced   out   "), 2);
        assert_eq!(tok.count(""), 0);
    }

    #[test]
    fn test_unknown_words_are_stable() {
        let tok = tokenizer();
        let a = tok.encode("zebra");
        let b = tok.encode("zebra");
        assert_eq!(a, b);
        assert!((a[0] as usize) < tok.vocab_size());
    }
}
