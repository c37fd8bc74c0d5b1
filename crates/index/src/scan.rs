//! Block-level scan iterators over a permutation.

use rdf_model::Id;

use crate::permutation::Permutation;

/// What to scan: a permutation plus up to two bound leading key columns and
/// an optional row limit (block-level truncation for LIMIT pushdown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec {
    pub permutation: Permutation,
    pub col0: Option<Id>,
    pub col1: Option<Id>,
    pub limit: Option<usize>,
}

impl ScanSpec {
    pub fn full(permutation: Permutation) -> ScanSpec {
        ScanSpec {
            permutation,
            col0: None,
            col1: None,
            limit: None,
        }
    }

    pub fn with_col0(permutation: Permutation, col0: Id) -> ScanSpec {
        ScanSpec {
            permutation,
            col0: Some(col0),
            col1: None,
            limit: None,
        }
    }

    pub fn with_col0_col1(permutation: Permutation, col0: Id, col1: Id) -> ScanSpec {
        ScanSpec {
            permutation,
            col0: Some(col0),
            col1: Some(col1),
            limit: None,
        }
    }

    /// Number of bound leading key columns.
    pub fn num_bound(&self) -> usize {
        match (self.col0, self.col1) {
            (None, _) => 0,
            (Some(_), None) => 1,
            (Some(_), Some(_)) => 2,
        }
    }

    /// Width of the scan output (one column per unbound key position).
    pub fn result_width(&self) -> usize {
        3 - self.num_bound()
    }
}

/// A contiguous, internally sorted chunk of scan output, column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub columns: Vec<Vec<Id>>,
}

impl Block {
    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

/// Iterator over the blocks of one scan. Rows are emitted in key order of the
/// remaining columns; consecutive blocks never overlap.
pub struct ScanBlocks<'a> {
    rows: &'a [[Id; 3]],
    first_output_key_col: usize,
    block_size: usize,
    remaining: usize,
}

impl<'a> ScanBlocks<'a> {
    pub(crate) fn new(
        rows: &'a [[Id; 3]],
        num_bound: usize,
        block_size: usize,
        limit: Option<usize>,
    ) -> ScanBlocks<'a> {
        ScanBlocks {
            rows,
            first_output_key_col: num_bound,
            block_size: block_size.max(1),
            remaining: limit.unwrap_or(usize::MAX),
        }
    }

    /// Total number of rows this scan will produce.
    pub fn total_rows(&self) -> usize {
        self.rows.len().min(self.remaining)
    }
}

impl Iterator for ScanBlocks<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.rows.is_empty() || self.remaining == 0 {
            return None;
        }
        let take = self.rows.len().min(self.block_size).min(self.remaining);
        let (chunk, rest) = self.rows.split_at(take);
        self.rows = rest;
        self.remaining -= take;
        let columns = (self.first_output_key_col..3)
            .map(|key_col| chunk.iter().map(|row| row[key_col]).collect())
            .collect();
        Some(Block { columns })
    }
}

/// Lexicographic lookup helpers over a sorted key range.
pub(crate) fn equal_range_col0(rows: &[[Id; 3]], col0: Id) -> &[[Id; 3]] {
    let start = rows.partition_point(|row| row[0] < col0);
    let end = rows.partition_point(|row| row[0] <= col0);
    &rows[start..end]
}

pub(crate) fn equal_range_col1(rows: &[[Id; 3]], col1: Id) -> &[[Id; 3]] {
    let start = rows.partition_point(|row| row[1] < col1);
    let end = rows.partition_point(|row| row[1] <= col1);
    &rows[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: i64) -> Id {
        Id::int(value).unwrap()
    }

    #[test]
    fn blocks_chunk_and_respect_limit() {
        let rows: Vec<[Id; 3]> = (0..10).map(|i| [id(0), id(i), id(i * 2)]).collect();
        let blocks: Vec<Block> = ScanBlocks::new(&rows, 1, 4, Some(7)).collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].num_rows(), 4);
        assert_eq!(blocks[1].num_rows(), 3);
        assert_eq!(blocks[0].num_columns(), 2);
        assert_eq!(blocks[0].columns[0][0], id(0));
    }

    #[test]
    fn equal_range_finds_runs() {
        let rows = vec![
            [id(1), id(1), id(1)],
            [id(2), id(1), id(1)],
            [id(2), id(2), id(1)],
            [id(3), id(1), id(1)],
        ];
        assert_eq!(equal_range_col0(&rows, id(2)).len(), 2);
        assert_eq!(equal_range_col0(&rows, id(9)).len(), 0);
        let sub = equal_range_col0(&rows, id(2));
        assert_eq!(equal_range_col1(sub, id(2)).len(), 1);
    }
}
