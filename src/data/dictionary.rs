use std::collections::{BTreeMap, HashMap};

use crate::data::batch::CaptionPair;

pub const PAD_TOKEN: &str = "<PAD>";
pub const BOS_TOKEN: &str = "<BOS>";
pub const EOS_TOKEN: &str = "<EOS>";
pub const UNK_TOKEN: &str = "<UNK>";

pub const PAD: usize = 0;
pub const BOS: usize = 1;
pub const EOS: usize = 2;
pub const UNK: usize = 3;

/// Word ↔ id mapping. Ids 0..4 are reserved for the special tokens; words
/// follow in lexicographic order so the same captions always yield the
/// same vocabulary.
#[derive(Debug, Clone)]
pub struct Dictionary {
    words: Vec<String>,
    index: HashMap<String, usize>,
}

impl Dictionary {
    pub fn build<'a, I>(captions: I, min_count: usize) -> Dictionary
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for caption in captions {
            for word in tokenize(caption) {
                *counts.entry(word).or_insert(0) += 1;
            }
        }

        let mut words: Vec<String> = [PAD_TOKEN, BOS_TOKEN, EOS_TOKEN, UNK_TOKEN]
            .iter()
            .map(|s| s.to_string())
            .collect();
        words.extend(counts.into_iter().filter(|(_, c)| *c >= min_count).map(|(w, _)| w));

        let index = words.iter().enumerate().map(|(i, w)| (w.clone(), i)).collect();
        Dictionary { words, index }
    }

    pub fn vocab_size(&self) -> usize {
        self.words.len()
    }

    pub fn id(&self, word: &str) -> usize {
        self.index.get(word).copied().unwrap_or(UNK)
    }

    pub fn encode(&self, caption: &str, cluster_vector: Option<Vec<f64>>) -> CaptionPair {
        let ids: Vec<usize> = tokenize(caption).iter().map(|w| self.id(w)).collect();

        let mut decoder_input = Vec::with_capacity(ids.len() + 1);
        decoder_input.push(BOS);
        decoder_input.extend(&ids);

        let mut target = ids;
        target.push(EOS);

        CaptionPair { decoder_input, target, cluster_vector }
    }

    /// Joins the words up to the first EOS, skipping PAD and BOS.
    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .take_while(|&&id| id != EOS)
            .filter(|&&id| id != PAD && id != BOS)
            .filter_map(|&id| self.words.get(id).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Lowercases and splits on anything that is not alphanumeric or `'`.
pub fn tokenize(caption: &str) -> Vec<String> {
    caption
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_deterministic() {
        let a = Dictionary::build(["a dog runs", "A cat sits."], 1);
        let b = Dictionary::build(["A cat sits.", "a dog runs"], 1);
        assert_eq!(a.words, b.words);
        assert_eq!(a.vocab_size(), 4 + 5);
        assert_eq!(a.id("a"), 4);
    }

    #[test]
    fn encode_shifts_target_by_one() {
        let dict = Dictionary::build(["a dog"], 1);
        let pair = dict.encode("A dog barks", None);
        assert_eq!(pair.decoder_input, vec![BOS, dict.id("a"), dict.id("dog"), UNK]);
        assert_eq!(pair.target, vec![dict.id("a"), dict.id("dog"), UNK, EOS]);
    }

    #[test]
    fn decode_stops_at_eos() {
        let dict = Dictionary::build(["a dog"], 1);
        let ids = vec![BOS, dict.id("a"), dict.id("dog"), EOS, dict.id("a")];
        assert_eq!(dict.decode(&ids), "a dog");
    }

    #[test]
    fn min_count_drops_rare_words() {
        let dict = Dictionary::build(["a a b"], 2);
        assert_eq!(dict.id("b"), UNK);
        assert_ne!(dict.id("a"), UNK);
    }
}
