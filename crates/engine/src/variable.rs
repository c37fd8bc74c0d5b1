//! Variables and variable-to-column maps.

use std::fmt;

use crate::idtable::ColumnIndex;

/// A SPARQL variable. The stored name never includes the `?` sigil.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(String);

impl Variable {
    pub fn new(name: impl Into<String>) -> Variable {
        let name = name.into();
        Variable(name.strip_prefix('?').map(str::to_string).unwrap_or(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

/// Whether a column can ever hold `Undefined`. `AlwaysDefined` lets joins
/// skip the UNDEF handling entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefStatus {
    AlwaysDefined,
    PossiblyUndef,
}

impl UndefStatus {
    pub fn or(self, other: UndefStatus) -> UndefStatus {
        if self == UndefStatus::PossiblyUndef || other == UndefStatus::PossiblyUndef {
            UndefStatus::PossiblyUndef
        } else {
            UndefStatus::AlwaysDefined
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnInfo {
    pub column: ColumnIndex,
    pub undef: UndefStatus,
}

/// Maps every output column of an operator to its variable. Columns are
/// dense: entry `i` describes column `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableMap {
    entries: Vec<(Variable, UndefStatus)>,
}

impl VariableMap {
    pub fn new() -> VariableMap {
        VariableMap::default()
    }

    /// Append the next column. Returns its index.
    pub fn push(&mut self, variable: Variable, undef: UndefStatus) -> ColumnIndex {
        debug_assert!(!self.contains(&variable), "duplicate variable {variable}");
        self.entries.push((variable, undef));
        self.entries.len() - 1
    }

    pub fn num_columns(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, variable: &Variable) -> bool {
        self.entries.iter().any(|(v, _)| v == variable)
    }

    pub fn column_of(&self, variable: &Variable) -> Option<ColumnIndex> {
        self.entries.iter().position(|(v, _)| v == variable)
    }

    pub fn info_of(&self, variable: &Variable) -> Option<ColumnInfo> {
        self.column_of(variable).map(|column| ColumnInfo {
            column,
            undef: self.entries[column].1,
        })
    }

    pub fn var_at(&self, column: ColumnIndex) -> Option<&Variable> {
        self.entries.get(column).map(|(v, _)| v)
    }

    pub fn undef_at(&self, column: ColumnIndex) -> UndefStatus {
        self.entries
            .get(column)
            .map_or(UndefStatus::PossiblyUndef, |(_, u)| *u)
    }

    pub fn set_undef_at(&mut self, column: ColumnIndex, undef: UndefStatus) {
        if let Some(entry) = self.entries.get_mut(column) {
            entry.1 = undef;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, UndefStatus)> {
        self.entries.iter().map(|(v, u)| (v, *u))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.entries.iter().map(|(v, _)| v)
    }

    /// Variables shared with `other`, as (column here, column there) pairs,
    /// ordered by the column index on this side.
    pub fn join_columns(&self, other: &VariableMap) -> Vec<[ColumnIndex; 2]> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(column, (variable, _))| {
                other.column_of(variable).map(|theirs| [column, theirs])
            })
            .collect()
    }

    /// True if no variable occurs in both maps.
    pub fn disjoint_with(&self, other: &VariableMap) -> bool {
        self.variables().all(|v| !other.contains(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigil_is_stripped() {
        assert_eq!(Variable::new("?x"), Variable::new("x"));
        assert_eq!(Variable::new("x").to_string(), "?x");
    }

    #[test]
    fn map_basics() {
        let mut map = VariableMap::new();
        map.push(Variable::new("a"), UndefStatus::AlwaysDefined);
        map.push(Variable::new("b"), UndefStatus::PossiblyUndef);
        assert_eq!(map.column_of(&Variable::new("b")), Some(1));
        assert_eq!(map.var_at(0), Some(&Variable::new("a")));
        assert_eq!(map.num_columns(), 2);
    }

    #[test]
    fn join_columns_by_shared_variables() {
        let mut left = VariableMap::new();
        left.push(Variable::new("x"), UndefStatus::AlwaysDefined);
        left.push(Variable::new("y"), UndefStatus::AlwaysDefined);
        let mut right = VariableMap::new();
        right.push(Variable::new("y"), UndefStatus::AlwaysDefined);
        right.push(Variable::new("z"), UndefStatus::AlwaysDefined);
        assert_eq!(left.join_columns(&right), vec![[1, 0]]);
        assert!(!left.disjoint_with(&right));
    }
}
