//! Per-query vocabulary for terms materialized at runtime.
//!
//! Terms produced by BIND, VALUES, GROUP_CONCAT and friends are not part of
//! the persistent vocabulary. They are appended to a [`LocalVocab`] owned by
//! the producing result and referenced through `LocalVocabIndex` ids. A
//! `LocalVocab` is immutable once its result is published, so sharing between
//! a result and its consumers is a refcount bump (`Arc`). It is never
//! persisted and never shared across queries.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::id::Id;

/// Append-only map from full lexical form to `LocalVocabIndex`.
#[derive(Debug, Default, Clone)]
pub struct LocalVocab {
    words: Vec<Arc<str>>,
    index: FxHashMap<Arc<str>, u64>,
}

impl LocalVocab {
    pub fn new() -> LocalVocab {
        LocalVocab::default()
    }

    /// Intern `word`, returning its `LocalVocabIndex` id. Re-adding an
    /// existing word returns the existing id.
    pub fn get_or_add(&mut self, word: &str) -> Id {
        if let Some(&idx) = self.index.get(word) {
            return Id::local_vocab_index(idx);
        }
        let idx = self.words.len() as u64;
        let arc: Arc<str> = word.into();
        self.words.push(Arc::clone(&arc));
        self.index.insert(arc, idx);
        Id::local_vocab_index(idx)
    }

    pub fn word(&self, index: u64) -> Option<&str> {
        self.words.get(index as usize).map(|w| &**w)
    }

    /// Resolve a `LocalVocabIndex` id.
    pub fn word_for_id(&self, id: Id) -> Option<&str> {
        self.word(id.local_vocab_index_value()?)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Which input of a binary operator an id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSide {
    Left,
    Right,
}

/// The result of merging the local vocabularies of two inputs.
///
/// The larger vocabulary is kept as the base; the smaller one is appended
/// with its indices remapped. Operators pass every id they copy into the
/// merged output through [`LocalVocabMerger::map_id`]; ids with any other tag
/// pass through unchanged, so this is cheap when no remapping is needed.
#[derive(Debug)]
pub struct LocalVocabMerger {
    merged: LocalVocab,
    remap_left: Option<Vec<u64>>,
    remap_right: Option<Vec<u64>>,
}

impl LocalVocabMerger {
    pub fn merge(left: &LocalVocab, right: &LocalVocab) -> LocalVocabMerger {
        if right.is_empty() {
            return LocalVocabMerger {
                merged: left.clone(),
                remap_left: None,
                remap_right: None,
            };
        }
        if left.is_empty() {
            return LocalVocabMerger {
                merged: right.clone(),
                remap_left: None,
                remap_right: None,
            };
        }
        let (base, other, other_is_left) = if left.len() >= right.len() {
            (left, right, false)
        } else {
            (right, left, true)
        };
        let mut merged = base.clone();
        let remap: Vec<u64> = other
            .words
            .iter()
            .map(|word| {
                merged
                    .get_or_add(word)
                    .local_vocab_index_value()
                    .unwrap_or_default()
            })
            .collect();
        if other_is_left {
            LocalVocabMerger {
                merged,
                remap_left: Some(remap),
                remap_right: None,
            }
        } else {
            LocalVocabMerger {
                merged,
                remap_left: None,
                remap_right: Some(remap),
            }
        }
    }

    /// True if ids from `side` need rewriting when copied into the output.
    pub fn needs_remap(&self, side: MergeSide) -> bool {
        match side {
            MergeSide::Left => self.remap_left.is_some(),
            MergeSide::Right => self.remap_right.is_some(),
        }
    }

    /// Rewrite `id` for the merged vocabulary. Non-local ids pass through.
    pub fn map_id(&self, side: MergeSide, id: Id) -> Id {
        let remap = match side {
            MergeSide::Left => &self.remap_left,
            MergeSide::Right => &self.remap_right,
        };
        match (remap, id.local_vocab_index_value()) {
            (Some(table), Some(old)) => {
                Id::local_vocab_index(table.get(old as usize).copied().unwrap_or(old))
            }
            _ => id,
        }
    }

    pub fn vocab(&self) -> &LocalVocab {
        &self.merged
    }

    pub fn into_vocab(self) -> LocalVocab {
        self.merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_add_deduplicates() {
        let mut vocab = LocalVocab::new();
        let a = vocab.get_or_add("\"alpha\"");
        let b = vocab.get_or_add("\"beta\"");
        let a2 = vocab.get_or_add("\"alpha\"");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.word_for_id(b), Some("\"beta\""));
    }

    #[test]
    fn merge_keeps_larger_side_stable() {
        let mut left = LocalVocab::new();
        let l0 = left.get_or_add("\"a\"");
        let l1 = left.get_or_add("\"b\"");
        let mut right = LocalVocab::new();
        let r0 = right.get_or_add("\"b\"");

        let merger = LocalVocabMerger::merge(&left, &right);
        assert!(!merger.needs_remap(MergeSide::Left));
        assert!(merger.needs_remap(MergeSide::Right));
        // Left ids are unchanged, the right id for "b" maps onto the left one.
        assert_eq!(merger.map_id(MergeSide::Left, l0), l0);
        assert_eq!(merger.map_id(MergeSide::Right, r0), l1);
        assert_eq!(merger.vocab().len(), 2);
    }

    #[test]
    fn merge_with_empty_is_shared() {
        let mut left = LocalVocab::new();
        left.get_or_add("\"x\"");
        let merger = LocalVocabMerger::merge(&left, &LocalVocab::new());
        assert!(!merger.needs_remap(MergeSide::Left));
        assert!(!merger.needs_remap(MergeSide::Right));
        assert_eq!(merger.vocab().len(), 1);
    }

    #[test]
    fn map_id_passes_other_tags_through() {
        let mut left = LocalVocab::new();
        left.get_or_add("\"x\"");
        let mut right = LocalVocab::new();
        right.get_or_add("\"y\"");
        right.get_or_add("\"z\"");
        let merger = LocalVocabMerger::merge(&left, &right);
        let vocab_id = Id::vocab_index(7);
        assert_eq!(merger.map_id(MergeSide::Left, vocab_id), vocab_id);
        assert_eq!(merger.map_id(MergeSide::Left, Id::UNDEFINED), Id::UNDEFINED);
    }
}
