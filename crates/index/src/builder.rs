//! Construction of an [`Index`] from parsed triples and text records.

use std::collections::BTreeSet;

use rdf_model::{Id, Term};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::permutation::Permutation;
use crate::store::{Index, PatternData, PermutationIndex};
use crate::text::TextIndex;
use crate::vocabulary::Vocabulary;
use crate::IndexResult;

/// Build-time options.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Rows per scan block.
    pub block_size: usize,
    /// All six permutations, or only PSO and POS.
    pub all_permutations: bool,
    /// Build the per-subject predicate sets (pattern trick support).
    pub with_patterns: bool,
}

impl Default for IndexConfig {
    fn default() -> IndexConfig {
        IndexConfig {
            block_size: 1 << 14,
            all_permutations: true,
            with_patterns: true,
        }
    }
}

/// Accumulates triples and text records, then builds the immutable [`Index`].
#[derive(Debug, Default)]
pub struct IndexBuilder {
    config: IndexConfig,
    triples: Vec<[Term; 3]>,
    documents: Vec<(String, Vec<Term>)>,
}

impl IndexBuilder {
    pub fn new(config: IndexConfig) -> IndexBuilder {
        IndexBuilder {
            config,
            triples: Vec::new(),
            documents: Vec::new(),
        }
    }

    pub fn add_triple(&mut self, subject: Term, predicate: Term, object: Term) {
        self.triples.push([subject, predicate, object]);
    }

    /// Parse and add a triple given the lexical forms of its terms.
    pub fn add(&mut self, subject: &str, predicate: &str, object: &str) -> IndexResult<()> {
        self.add_triple(
            Term::parse(subject)?,
            Term::parse(predicate)?,
            Term::parse(object)?,
        );
        Ok(())
    }

    /// Add a text record with the entities it mentions.
    pub fn add_text_record(&mut self, text: &str, entities: Vec<Term>) {
        self.documents.push((text.to_string(), entities));
    }

    pub fn build(self) -> IndexResult<Index> {
        let IndexBuilder {
            config,
            triples,
            documents,
        } = self;

        // Vocabulary: every term that is neither inlined nor a blank node.
        let mut words = BTreeSet::new();
        let mut blank_labels = BTreeSet::new();
        let mut collect = |term: &Term| match term {
            Term::BlankNode(label) => {
                blank_labels.insert(label.clone());
            }
            term if term.value_id().is_none() => {
                words.insert(term.to_string());
            }
            _ => {}
        };
        for [s, p, o] in &triples {
            collect(s);
            collect(p);
            collect(o);
        }
        for (_, entities) in &documents {
            for entity in entities {
                collect(entity);
            }
        }
        let vocabulary = Vocabulary::from_words(words);
        let blank_labels: Vec<String> = blank_labels.into_iter().collect();

        let encode = |term: &Term| -> Id {
            if let Some(id) = term.value_id() {
                return id;
            }
            if let Term::BlankNode(label) = term {
                let pos = blank_labels
                    .binary_search(label)
                    .expect("blank label was collected above");
                return Id::blank_node_index(pos as u64);
            }
            vocabulary
                .get_id(&term.to_string())
                .expect("word was collected above")
        };

        let mut encoded: Vec<[Id; 3]> = triples
            .iter()
            .map(|[s, p, o]| [encode(s), encode(p), encode(o)])
            .collect();
        encoded.sort_unstable();
        encoded.dedup();

        let enabled: Vec<Permutation> = if config.all_permutations {
            Permutation::all().to_vec()
        } else {
            Permutation::reduced().to_vec()
        };
        let mut permutations = FxHashMap::default();
        for permutation in enabled {
            permutations.insert(permutation, PermutationIndex::build(&encoded, permutation));
        }

        let distinct = [0, 1, 2].map(|position| {
            let mut values: Vec<Id> = encoded.iter().map(|t| t[position]).collect();
            values.sort_unstable();
            values.dedup();
            values.len()
        });

        let patterns = config.with_patterns.then(|| build_patterns(&encoded));

        let text = (!documents.is_empty()).then(|| {
            let mut text = TextIndex::default();
            for (content, entities) in &documents {
                let entity_ids: Vec<Id> = entities.iter().map(&encode).collect();
                text.add_record(content, &entity_ids);
            }
            text
        });

        debug!(
            num_triples = encoded.len(),
            vocab_size = vocabulary.len(),
            "index build finished"
        );

        Ok(Index {
            vocabulary,
            blank_labels,
            permutations,
            block_size: config.block_size,
            num_triples: encoded.len(),
            distinct,
            patterns,
            text,
        })
    }
}

fn build_patterns(triples: &[[Id; 3]]) -> PatternData {
    // Group the (already sorted) SPO triples by subject and deduplicate the
    // per-subject predicate lists.
    let mut data = PatternData::default();
    let mut pattern_ids: FxHashMap<Vec<Id>, u32> = FxHashMap::default();
    let mut start = 0;
    while start < triples.len() {
        let subject = triples[start][0];
        let end = start + triples[start..].partition_point(|t| t[0] <= subject);
        let mut predicates: Vec<Id> = triples[start..end].iter().map(|t| t[1]).collect();
        predicates.dedup();
        let next_id = pattern_ids.len() as u32;
        let pattern = *pattern_ids.entry(predicates.clone()).or_insert(next_id);
        if pattern == next_id {
            data.patterns.push(predicates);
        }
        data.subjects.push((subject, pattern));
        data.subject_pattern.insert(subject, pattern);
        start = end;
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanSpec;

    fn small_index() -> Index {
        let mut builder = IndexBuilder::new(IndexConfig {
            block_size: 2,
            ..IndexConfig::default()
        });
        builder.add("<s>", "<p>", "<c>").unwrap();
        builder.add("<s>", "<p>", "<c2>").unwrap();
        builder.add("<s>", "<p2>", "<c>").unwrap();
        builder.add("<s2>", "<p2>", "<c2>").unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn scan_with_bound_predicate() {
        let index = small_index();
        let p = index.get_id(&Term::iri("p")).unwrap();
        let scan = index
            .scan(&ScanSpec::with_col0(Permutation::Pso, p))
            .unwrap();
        let blocks: Vec<_> = scan.collect();
        let total: usize = blocks.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
        // Two output columns: subject, object.
        assert!(blocks.iter().all(|b| b.num_columns() == 2));
    }

    #[test]
    fn empty_scan_for_missing_key() {
        let index = small_index();
        let missing = index.get_id(&Term::iri("absent"));
        assert_eq!(missing, None);
        let p = index.get_id(&Term::iri("p")).unwrap();
        assert!(index.col0_id_exists(Permutation::Pso, p));
        assert!(!index.col0_id_exists(Permutation::Spo, p));
    }

    #[test]
    fn metadata_counts_and_multiplicities() {
        let index = small_index();
        let p = index.get_id(&Term::iri("p")).unwrap();
        let meta = index.relation_metadata(Permutation::Pso, p).unwrap();
        assert_eq!(meta.num_rows, 2);
        // Subject <s> appears twice under <p>.
        assert!(!meta.is_functional);
        assert_eq!(meta.multiplicity_col1, 2.0);
        assert_eq!(meta.multiplicity_col2, 1.0);
    }

    #[test]
    fn distinct_counts() {
        let index = small_index();
        assert_eq!(index.num_triples(), 4);
        assert_eq!(index.num_distinct_subjects(), 2);
        assert_eq!(index.num_distinct_predicates(), 2);
        assert_eq!(index.num_distinct_objects(), 2);
    }

    #[test]
    fn id_term_roundtrip() {
        let index = small_index();
        for term in [Term::iri("s"), Term::iri("p2"), Term::iri("c2")] {
            // Terms are stored with full IRI brackets; build them the same way.
            let term = Term::parse(&term.to_string()).unwrap();
            let id = index.get_id(&term).unwrap();
            assert_eq!(index.id_to_term(id), Some(term));
        }
    }

    #[test]
    fn pattern_data_deduplicates() {
        let index = small_index();
        let s = index.get_id(&Term::iri("s")).unwrap();
        let s2 = index.get_id(&Term::iri("s2")).unwrap();
        let p2 = index.get_id(&Term::iri("p2")).unwrap();
        let of_s = index.predicates_of(s).unwrap().unwrap();
        assert_eq!(of_s.len(), 2);
        let of_s2 = index.predicates_of(s2).unwrap().unwrap();
        assert_eq!(of_s2, &[p2]);
        assert_eq!(index.subjects_with_patterns().unwrap().len(), 2);
    }

    #[test]
    fn reduced_permutation_set() {
        let mut builder = IndexBuilder::new(IndexConfig {
            all_permutations: false,
            ..IndexConfig::default()
        });
        builder.add("<s>", "<p>", "<o>").unwrap();
        let index = builder.build().unwrap();
        assert!(index.permutation_enabled(Permutation::Pso));
        assert!(index.permutation_enabled(Permutation::Pos));
        assert!(!index.permutation_enabled(Permutation::Spo));
        assert!(index.scan(&ScanSpec::full(Permutation::Spo)).is_err());
    }
}
