//! Per-relation statistics kept next to each permutation.

/// Statistics for one `col0` value (relation) of a permutation. These feed
/// the planner's size and multiplicity estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelationMetadata {
    /// Number of triples with this `col0`.
    pub num_rows: u64,
    /// True if every `col1` value appears at most once.
    pub is_functional: bool,
    /// Average number of rows per distinct `col1` value.
    pub multiplicity_col1: f64,
    /// Average number of rows per distinct `col2` value.
    pub multiplicity_col2: f64,
}

impl RelationMetadata {
    pub(crate) fn compute(rows: &[[rdf_model::Id; 3]]) -> RelationMetadata {
        debug_assert!(!rows.is_empty());
        let num_rows = rows.len() as u64;
        let mut distinct_col1 = 1u64;
        for window in rows.windows(2) {
            if window[0][1] != window[1][1] {
                distinct_col1 += 1;
            }
        }
        let mut col2: Vec<_> = rows.iter().map(|row| row[2]).collect();
        col2.sort_unstable();
        col2.dedup();
        let distinct_col2 = col2.len().max(1) as u64;
        RelationMetadata {
            num_rows,
            is_functional: distinct_col1 == num_rows,
            multiplicity_col1: num_rows as f64 / distinct_col1 as f64,
            multiplicity_col2: num_rows as f64 / distinct_col2 as f64,
        }
    }
}
