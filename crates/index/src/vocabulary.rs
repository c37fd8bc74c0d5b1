//! The persistent string vocabulary.

use std::collections::BTreeSet;
use std::sync::Arc;

use rdf_model::Id;

/// Sorted, deduplicated term dictionary. `VocabIndex` payloads are positions
/// in the sorted order, so the id order of vocabulary entries equals the
/// lexicographic order of their lexical forms.
#[derive(Debug, Default)]
pub struct Vocabulary {
    words: Vec<Arc<str>>,
}

impl Vocabulary {
    pub(crate) fn from_words(words: BTreeSet<String>) -> Vocabulary {
        Vocabulary {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    /// Look up the id of a term's lexical form.
    pub fn get_id(&self, word: &str) -> Option<Id> {
        self.words
            .binary_search_by(|probe| (**probe).cmp(word))
            .ok()
            .map(|pos| Id::vocab_index(pos as u64))
    }

    /// The position `word` occupies or would occupy in the sorted order.
    /// Useful to form id-range boundaries for words not in the vocabulary.
    pub fn insertion_point(&self, word: &str) -> u64 {
        self.words.partition_point(|probe| (**probe) < *word) as u64
    }

    /// The lexical form stored at `index`.
    pub fn word(&self, index: u64) -> Option<&str> {
        self.words.get(index as usize).map(|w| &**w)
    }

    /// Resolve a `VocabIndex` id.
    pub fn word_for_id(&self, id: Id) -> Option<&str> {
        self.word(id.vocab_index_value()?)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(words: &[&str]) -> Vocabulary {
        Vocabulary::from_words(words.iter().map(|w| w.to_string()).collect())
    }

    #[test]
    fn lookup_roundtrip() {
        let vocab = vocab(&["<a>", "<b>", "<c>"]);
        for word in ["<a>", "<b>", "<c>"] {
            let id = vocab.get_id(word).unwrap();
            assert_eq!(vocab.word_for_id(id), Some(word));
        }
        assert_eq!(vocab.get_id("<missing>"), None);
    }

    #[test]
    fn id_order_is_lexicographic() {
        let vocab = vocab(&["<b>", "<a>", "<c>"]);
        let a = vocab.get_id("<a>").unwrap();
        let b = vocab.get_id("<b>").unwrap();
        let c = vocab.get_id("<c>").unwrap();
        assert!(a < b && b < c);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_inserted_word_roundtrips(
                words in proptest::collection::btree_set("[a-z]{1,8}", 1..30)
            ) {
                let vocab = Vocabulary::from_words(words.clone());
                for word in &words {
                    let id = vocab.get_id(word).unwrap();
                    prop_assert_eq!(vocab.word_for_id(id), Some(word.as_str()));
                }
            }
        }
    }
}
