//! The read-only [`Index`] facade.

use rdf_model::{Id, Tag, Term};
use rustc_hash::FxHashMap;

use crate::metadata::RelationMetadata;
use crate::permutation::Permutation;
use crate::scan::{equal_range_col0, equal_range_col1, ScanBlocks, ScanSpec};
use crate::text::TextIndex;
use crate::vocabulary::Vocabulary;
use crate::{IndexError, IndexResult};

/// Identifier of one entry in the pattern data (a distinct predicate set).
pub type PatternId = u32;

/// One sorted permutation of the triple set plus its relation metadata.
#[derive(Debug)]
pub(crate) struct PermutationIndex {
    /// Triples in key order of the permutation, sorted.
    rows: Vec<[Id; 3]>,
    /// Relation metadata keyed by col0.
    meta: FxHashMap<Id, RelationMetadata>,
}

impl PermutationIndex {
    pub(crate) fn build(triples: &[[Id; 3]], permutation: Permutation) -> PermutationIndex {
        let mut rows: Vec<[Id; 3]> = triples
            .iter()
            .map(|&triple| permutation.key_of(triple))
            .collect();
        rows.sort_unstable();
        let mut meta = FxHashMap::default();
        let mut start = 0;
        while start < rows.len() {
            let col0 = rows[start][0];
            let end = start + rows[start..].partition_point(|row| row[0] <= col0);
            meta.insert(col0, RelationMetadata::compute(&rows[start..end]));
            start = end;
        }
        PermutationIndex { rows, meta }
    }

    fn scan(&self, spec: &ScanSpec, block_size: usize) -> ScanBlocks<'_> {
        let rows: &[[Id; 3]] = match (spec.col0, spec.col1) {
            (None, _) => &self.rows,
            (Some(col0), None) => equal_range_col0(&self.rows, col0),
            (Some(col0), Some(col1)) => {
                equal_range_col1(equal_range_col0(&self.rows, col0), col1)
            }
        };
        ScanBlocks::new(rows, spec.num_bound(), block_size, spec.limit)
    }
}

/// Pattern data: for every subject the sorted set of its distinct predicates,
/// deduplicated across subjects.
#[derive(Debug, Default)]
pub(crate) struct PatternData {
    pub(crate) patterns: Vec<Vec<Id>>,
    /// Sorted by subject id, so full has-predicate scans stream in order.
    pub(crate) subjects: Vec<(Id, PatternId)>,
    pub(crate) subject_pattern: FxHashMap<Id, PatternId>,
}

/// Read-only, shared access to the indexed data. One instance serves all
/// queries concurrently; nothing here is mutable after construction.
#[derive(Debug)]
pub struct Index {
    pub(crate) vocabulary: Vocabulary,
    pub(crate) blank_labels: Vec<String>,
    pub(crate) permutations: FxHashMap<Permutation, PermutationIndex>,
    pub(crate) block_size: usize,
    pub(crate) num_triples: usize,
    /// Distinct (subjects, predicates, objects).
    pub(crate) distinct: [usize; 3],
    pub(crate) patterns: Option<PatternData>,
    pub(crate) text: Option<TextIndex>,
}

impl Index {
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Resolve a term to its id: inline encodings first, then blank labels,
    /// then the vocabulary.
    pub fn get_id(&self, term: &Term) -> Option<Id> {
        if let Some(id) = term.value_id() {
            return Some(id);
        }
        if let Term::BlankNode(label) = term {
            return self
                .blank_labels
                .binary_search(label)
                .ok()
                .map(|pos| Id::blank_node_index(pos as u64));
        }
        self.vocabulary.get_id(&term.to_string())
    }

    /// Inverse of [`Index::get_id`] for ids owned by the index. Ids with the
    /// `LocalVocabIndex` tag belong to a query and must be resolved there.
    pub fn id_to_term(&self, id: Id) -> Option<Term> {
        match id.tag() {
            Tag::VocabIndex => Term::parse(self.vocabulary.word_for_id(id)?).ok(),
            Tag::BlankNodeIndex => self
                .blank_labels
                .get(id.payload() as usize)
                .map(|label| Term::blank(label.clone())),
            Tag::Bool => Some(Term::literal_typed(
                if id.as_bool()? { "true" } else { "false" },
                rdf_model::xsd::BOOLEAN,
            )),
            Tag::Int => Some(Term::literal_typed(
                id.as_int()?.to_string(),
                rdf_model::xsd::INTEGER,
            )),
            Tag::Double => Some(Term::literal_typed(
                format_double(id.as_double()?),
                rdf_model::xsd::DOUBLE,
            )),
            Tag::Date => {
                let date = id.as_date()?;
                Some(Term::literal_typed(
                    format!("{:04}-{:02}-{:02}", date.year, date.month, date.day),
                    rdf_model::xsd::DATE,
                ))
            }
            _ => None,
        }
    }

    pub fn permutation_enabled(&self, permutation: Permutation) -> bool {
        self.permutations.contains_key(&permutation)
    }

    /// Block-level scan. Errs if the permutation was not built.
    pub fn scan(&self, spec: &ScanSpec) -> IndexResult<ScanBlocks<'_>> {
        let permutation = self
            .permutations
            .get(&spec.permutation)
            .ok_or(IndexError::PermutationDisabled(spec.permutation))?;
        Ok(permutation.scan(spec, self.block_size))
    }

    /// Whether `id` occurs as the leading key column of `permutation`.
    pub fn col0_id_exists(&self, permutation: Permutation, id: Id) -> bool {
        self.permutations
            .get(&permutation)
            .is_some_and(|p| p.meta.contains_key(&id))
    }

    pub fn relation_metadata(
        &self,
        permutation: Permutation,
        col0: Id,
    ) -> Option<RelationMetadata> {
        self.permutations.get(&permutation)?.meta.get(&col0).copied()
    }

    pub fn num_triples(&self) -> usize {
        self.num_triples
    }

    pub fn num_distinct_subjects(&self) -> usize {
        self.distinct[0]
    }

    pub fn num_distinct_predicates(&self) -> usize {
        self.distinct[1]
    }

    pub fn num_distinct_objects(&self) -> usize {
        self.distinct[2]
    }

    // ---- pattern data ------------------------------------------------------

    /// The sorted predicate set of `subject`, if pattern data was built.
    pub fn predicates_of(&self, subject: Id) -> IndexResult<Option<&[Id]>> {
        let patterns = self.patterns.as_ref().ok_or(IndexError::NoPatternData)?;
        Ok(patterns
            .subject_pattern
            .get(&subject)
            .map(|&pattern| patterns.patterns[pattern as usize].as_slice()))
    }

    /// All (subject, pattern) pairs sorted by subject.
    pub fn subjects_with_patterns(&self) -> IndexResult<&[(Id, PatternId)]> {
        let patterns = self.patterns.as_ref().ok_or(IndexError::NoPatternData)?;
        Ok(&patterns.subjects)
    }

    pub fn pattern(&self, pattern: PatternId) -> IndexResult<&[Id]> {
        let patterns = self.patterns.as_ref().ok_or(IndexError::NoPatternData)?;
        Ok(patterns
            .patterns
            .get(pattern as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[]))
    }

    // ---- text index --------------------------------------------------------

    pub fn text_index(&self) -> IndexResult<&TextIndex> {
        self.text.as_ref().ok_or(IndexError::NoTextIndex)
    }

    pub fn has_text_index(&self) -> bool {
        self.text.is_some()
    }
}

fn format_double(value: f64) -> String {
    if value == value.trunc() && value.is_finite() {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}
