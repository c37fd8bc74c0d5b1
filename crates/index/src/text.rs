//! The text index: word postings and entity postings.
//!
//! Only the operator-level contract of the full-text subsystem is provided:
//! a word scan (exact word or `prefix*`) yielding sorted text-record ids, and
//! an entity scan yielding (record, entity, score) postings. Tokenization is
//! whitespace/punctuation based; scores count mentions.

use std::collections::BTreeMap;

use rdf_model::Id;
use rustc_hash::FxHashMap;

/// One posting of a word scan: the record it occurs in plus the concrete
/// word that matched (relevant for prefix scans).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordPosting {
    pub record: u64,
    pub word: String,
}

/// In-memory text index over a collection of text records.
#[derive(Debug, Default)]
pub struct TextIndex {
    num_records: u64,
    /// word -> sorted record ids.
    word_postings: BTreeMap<String, Vec<u64>>,
    /// Sorted by (record, entity).
    entity_postings: Vec<(u64, Id, u64)>,
}

impl TextIndex {
    pub(crate) fn add_record(&mut self, text: &str, entities: &[Id]) -> u64 {
        let record = self.num_records;
        self.num_records += 1;
        for token in tokenize(text) {
            let postings = self.word_postings.entry(token.to_string()).or_default();
            if postings.last() != Some(&record) {
                postings.push(record);
            }
        }
        let mut scores: FxHashMap<Id, u64> = FxHashMap::default();
        for &entity in entities {
            *scores.entry(entity).or_insert(0) += 1;
        }
        let mut batch: Vec<_> = scores
            .into_iter()
            .map(|(entity, score)| (record, entity, score))
            .collect();
        batch.sort_unstable_by_key(|&(_, entity, _)| entity);
        self.entity_postings.extend(batch);
        record
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    /// All postings for `word`. A trailing `*` makes this a prefix scan; the
    /// result is sorted by (record, word).
    pub fn word_scan(&self, word: &str) -> Vec<WordPosting> {
        let mut result: Vec<WordPosting> = if let Some(prefix) = word.strip_suffix('*') {
            self.word_postings
                .range(prefix.to_string()..)
                .take_while(|(w, _)| w.starts_with(prefix))
                .flat_map(|(w, records)| {
                    records.iter().map(move |&record| WordPosting {
                        record,
                        word: w.clone(),
                    })
                })
                .collect()
        } else {
            self.word_postings
                .get(word)
                .into_iter()
                .flat_map(|records| {
                    records.iter().map(|&record| WordPosting {
                        record,
                        word: word.to_string(),
                    })
                })
                .collect()
        };
        result.sort_by(|a, b| (a.record, &a.word).cmp(&(b.record, &b.word)));
        result
    }

    /// All (record, entity, score) postings, sorted by (record, entity).
    pub fn entity_postings(&self) -> &[(u64, Id, u64)] {
        &self.entity_postings
    }

    /// Postings of a fixed entity, sorted by record.
    pub fn entity_scan(&self, entity: Id) -> Vec<(u64, u64)> {
        self.entity_postings
            .iter()
            .filter(|&&(_, e, _)| e == entity)
            .map(|&(record, _, score)| (record, score))
            .collect()
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(i: u64) -> Id {
        Id::vocab_index(i)
    }

    #[test]
    fn word_scan_exact_and_prefix() {
        let mut index = TextIndex::default();
        index.add_record("the quick brown fox", &[entity(1)]);
        index.add_record("quixotic quests", &[entity(2)]);

        let exact = index.word_scan("quick");
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].record, 0);

        let prefix = index.word_scan("qui*");
        let words: Vec<_> = prefix.iter().map(|p| p.word.as_str()).collect();
        assert_eq!(words, ["quick", "quixotic"]);
        assert!(prefix.windows(2).all(|w| w[0].record <= w[1].record));
    }

    #[test]
    fn entity_postings_sorted_and_scored() {
        let mut index = TextIndex::default();
        index.add_record("a b", &[entity(2), entity(1), entity(2)]);
        index.add_record("c", &[entity(1)]);
        let postings = index.entity_postings();
        assert_eq!(postings.len(), 3);
        assert!(postings.windows(2).all(|w| (w[0].0, w[0].1) <= (w[1].0, w[1].1)));
        // entity 2 was mentioned twice in record 0.
        assert!(postings.contains(&(0, entity(2), 2)));
        assert_eq!(index.entity_scan(entity(1)), vec![(0, 1), (1, 1)]);
    }
}
