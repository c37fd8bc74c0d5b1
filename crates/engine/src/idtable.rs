//! Columnar tables of [`Id`]s.
//!
//! An [`IdTable`] is a column-major matrix with a fixed column count set at
//! construction. All growth is accounted against the query's [`MemoryLimit`];
//! the bytes are released when the table drops. Width-zero tables are legal
//! and still carry a row count (the neutral element is the 1×0 table).

use rayon::prelude::*;
use rdf_model::Id;

use crate::error::EngineResult;
use crate::memory::MemoryLimit;

pub type ColumnIndex = usize;

const ID_BYTES: usize = std::mem::size_of::<Id>();
const MIN_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct IdTable {
    columns: Vec<Vec<Id>>,
    num_rows: usize,
    limit: MemoryLimit,
    /// Row capacity already accounted for.
    reserved_rows: usize,
}

impl IdTable {
    pub fn new(num_columns: usize, limit: MemoryLimit) -> IdTable {
        IdTable {
            columns: vec![Vec::new(); num_columns],
            num_rows: 0,
            limit,
            reserved_rows: 0,
        }
    }

    /// Take ownership of pre-built columns (all of equal length), accounting
    /// for their memory.
    pub fn from_columns(columns: Vec<Vec<Id>>, limit: MemoryLimit) -> EngineResult<IdTable> {
        let num_rows = columns.first().map_or(0, Vec::len);
        debug_assert!(columns.iter().all(|c| c.len() == num_rows));
        limit.try_reserve(num_rows * columns.len() * ID_BYTES)?;
        Ok(IdTable {
            num_rows,
            reserved_rows: num_rows,
            columns,
            limit,
        })
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn memory_limit(&self) -> &MemoryLimit {
        &self.limit
    }

    fn ensure_capacity(&mut self, additional: usize) -> EngineResult<()> {
        let needed = self.num_rows + additional;
        if needed <= self.reserved_rows {
            return Ok(());
        }
        let new_cap = needed.max(self.reserved_rows * 2).max(MIN_CAPACITY);
        let grow = new_cap - self.reserved_rows;
        self.limit
            .try_reserve(grow * self.num_columns() * ID_BYTES)?;
        for column in &mut self.columns {
            column.reserve(new_cap - column.len());
        }
        self.reserved_rows = new_cap;
        Ok(())
    }

    pub fn push_row(&mut self, row: &[Id]) -> EngineResult<()> {
        debug_assert_eq!(row.len(), self.num_columns());
        self.ensure_capacity(1)?;
        for (column, &id) in self.columns.iter_mut().zip(row) {
            column.push(id);
        }
        self.num_rows += 1;
        Ok(())
    }

    /// Grow (filling with `Undefined`) or shrink to exactly `rows` rows.
    pub fn resize(&mut self, rows: usize) -> EngineResult<()> {
        if rows > self.num_rows {
            self.ensure_capacity(rows - self.num_rows)?;
        }
        for column in &mut self.columns {
            column.resize(rows, Id::UNDEFINED);
        }
        self.num_rows = rows;
        Ok(())
    }

    pub fn column(&self, column: ColumnIndex) -> &[Id] {
        &self.columns[column]
    }

    pub fn column_mut(&mut self, column: ColumnIndex) -> &mut [Id] {
        &mut self.columns[column]
    }

    #[inline]
    pub fn at(&self, row: usize, column: ColumnIndex) -> Id {
        self.columns[column][row]
    }

    #[inline]
    pub fn set(&mut self, row: usize, column: ColumnIndex, id: Id) {
        self.columns[column][row] = id;
    }

    pub fn row_vec(&self, row: usize) -> Vec<Id> {
        self.columns.iter().map(|column| column[row]).collect()
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = Vec<Id>> + '_ {
        (0..self.num_rows).map(move |row| self.row_vec(row))
    }

    pub fn try_clone(&self) -> EngineResult<IdTable> {
        IdTable::from_columns(self.columns.clone(), self.limit.clone())
    }

    /// Copy of the given columns, in the given order.
    pub fn select_columns(&self, columns: &[ColumnIndex]) -> EngineResult<IdTable> {
        let selected = columns.iter().map(|&c| self.columns[c].clone()).collect();
        IdTable::from_columns(selected, self.limit.clone())
    }

    /// Zero-copy column-subset view.
    pub fn view<'a>(&'a self, columns: &'a [ColumnIndex]) -> IdTableView<'a> {
        IdTableView {
            table: self,
            columns,
        }
    }

    /// Lexicographic comparison of two rows over column subsets of possibly
    /// different tables. The subsets must have equal length.
    pub fn cmp_rows_on(
        &self,
        row: usize,
        cols: &[ColumnIndex],
        other: &IdTable,
        other_row: usize,
        other_cols: &[ColumnIndex],
    ) -> std::cmp::Ordering {
        debug_assert_eq!(cols.len(), other_cols.len());
        for (&a, &b) in cols.iter().zip(other_cols) {
            let ordering = self.at(row, a).cmp(&other.at(other_row, b));
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    }

    pub fn is_sorted_by(&self, columns: &[ColumnIndex]) -> bool {
        (1..self.num_rows).all(|row| {
            self.cmp_rows_on(row - 1, columns, self, row, columns) != std::cmp::Ordering::Greater
        })
    }

    /// Stable sort of all rows by the given columns (internal id order).
    pub fn sort_by_columns(&mut self, columns: &[ColumnIndex]) {
        if self.num_rows <= 1 || self.num_columns() == 0 {
            return;
        }
        let mut permutation: Vec<usize> = (0..self.num_rows).collect();
        permutation.par_sort_by(|&a, &b| self.cmp_rows_on(a, columns, self, b, columns));
        self.apply_row_permutation(&permutation);
    }

    /// Reorder rows so that output row `i` is former row `permutation[i]`.
    pub fn apply_row_permutation(&mut self, permutation: &[usize]) {
        debug_assert_eq!(permutation.len(), self.num_rows);
        for column in &mut self.columns {
            let reordered: Vec<Id> = permutation.iter().map(|&row| column[row]).collect();
            *column = reordered;
        }
    }

    /// Drop all rows except the half-open range.
    pub fn keep_row_range(&mut self, start: usize, end: usize) {
        let end = end.min(self.num_rows);
        let start = start.min(end);
        for column in &mut self.columns {
            column.truncate(end);
            column.drain(..start);
        }
        self.num_rows = end - start;
    }

    pub fn column_bytes(&self) -> usize {
        self.reserved_rows * self.num_columns() * ID_BYTES
    }
}

impl Drop for IdTable {
    fn drop(&mut self) {
        self.limit
            .release(self.reserved_rows * self.num_columns() * ID_BYTES);
    }
}

impl PartialEq for IdTable {
    fn eq(&self, other: &IdTable) -> bool {
        self.num_rows == other.num_rows && self.columns == other.columns
    }
}

/// Borrowed column-subset projection of an [`IdTable`].
#[derive(Debug, Clone, Copy)]
pub struct IdTableView<'a> {
    table: &'a IdTable,
    columns: &'a [ColumnIndex],
}

impl IdTableView<'_> {
    pub fn num_rows(&self) -> usize {
        self.table.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn at(&self, row: usize, column: usize) -> Id {
        self.table.at(row, self.columns[column])
    }

    pub fn row_vec(&self, row: usize) -> Vec<Id> {
        self.columns
            .iter()
            .map(|&column| self.table.at(row, column))
            .collect()
    }

    pub fn cmp_rows(&self, row: usize, other: &IdTableView<'_>, other_row: usize) -> std::cmp::Ordering {
        self.table
            .cmp_rows_on(row, self.columns, other.table, other_row, other.columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: i64) -> Id {
        Id::int(value).unwrap()
    }

    fn table(rows: &[[i64; 2]]) -> IdTable {
        let mut t = IdTable::new(2, MemoryLimit::unlimited());
        for row in rows {
            t.push_row(&[id(row[0]), id(row[1])]).unwrap();
        }
        t
    }

    #[test]
    fn push_and_access() {
        let t = table(&[[1, 2], [3, 4]]);
        assert_eq!(t.num_rows(), 2);
        assert_eq!(t.at(1, 0), id(3));
        assert_eq!(t.row_vec(0), vec![id(1), id(2)]);
    }

    #[test]
    fn memory_limit_enforced() {
        let limit = MemoryLimit::new(128);
        let mut t = IdTable::new(4, limit);
        // 64 rows * 4 columns * 8 bytes blows the 128-byte budget.
        assert!(t.push_row(&[Id::UNDEFINED; 4]).is_err());
    }

    #[test]
    fn drop_releases_reservation() {
        let limit = MemoryLimit::new(1 << 16);
        {
            let mut t = IdTable::new(2, limit.clone());
            t.push_row(&[id(1), id(2)]).unwrap();
            assert!(limit.used() > 0);
        }
        assert_eq!(limit.used(), 0);
    }

    #[test]
    fn sort_and_sortedness() {
        let mut t = table(&[[3, 1], [1, 2], [2, 0], [1, 1]]);
        assert!(!t.is_sorted_by(&[0, 1]));
        t.sort_by_columns(&[0, 1]);
        assert!(t.is_sorted_by(&[0, 1]));
        assert_eq!(t.column(0), &[id(1), id(1), id(2), id(3)]);
        assert_eq!(t.column(1), &[id(1), id(2), id(0), id(1)]);
    }

    #[test]
    fn views_project_columns() {
        let t = table(&[[1, 10], [2, 20]]);
        let cols = [1];
        let view = t.view(&cols);
        assert_eq!(view.num_columns(), 1);
        assert_eq!(view.at(1, 0), id(20));
    }

    #[test]
    fn keep_row_range_applies_limit_offset() {
        let mut t = table(&[[0, 0], [1, 1], [2, 2], [3, 3]]);
        t.keep_row_range(1, 3);
        assert_eq!(t.num_rows(), 2);
        assert_eq!(t.column(0), &[id(1), id(2)]);
    }

    #[test]
    fn zero_width_table_counts_rows() {
        let mut t = IdTable::new(0, MemoryLimit::unlimited());
        t.push_row(&[]).unwrap();
        assert_eq!(t.num_rows(), 1);
        assert_eq!(t.num_columns(), 0);
    }
}
