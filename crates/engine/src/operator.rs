//! The physical operator vocabulary.
//!
//! Plans are immutable trees of these variants, stored in a
//! [`crate::arena::PlanArena`] and addressed by handle. Each variant only
//! carries its own parameters; children, estimates and variable maps live on
//! the arena node.

use rdf_model::{Id, Term};

use crate::expression::Expression;
use crate::idtable::ColumnIndex;
use crate::variable::Variable;
use index::Permutation;

/// A fixed endpoint or a variable one.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Var(Variable),
    Fixed(Id),
}

/// Pairs of (left column, right column) joined on.
pub type JoinColumns = Vec<[ColumnIndex; 2]>;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexScanOp {
    pub permutation: Permutation,
    /// Fixed ids in triple order (subject, predicate, object).
    pub fixed: [Option<Id>; 3],
    /// Variables of the free positions, in triple order.
    pub variables: [Option<Variable>; 3],
    /// Set when a fixed term did not resolve against the vocabulary; the
    /// scan is empty without touching the index.
    pub term_unknown: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOp {
    /// Left and right column of the single join column.
    pub join_cols: [ColumnIndex; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiColumnJoinOp {
    pub join_cols: JoinColumns,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionalJoinOp {
    pub join_cols: JoinColumns,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinusOp {
    pub join_cols: JoinColumns,
}

/// Which side of a transitive path is bound by a side table (child 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitivePathOp {
    pub min: u64,
    pub max: u64,
    pub left: Endpoint,
    pub right: Endpoint,
    /// When set, child 1 is a side table whose `bound_join_col` column seeds
    /// the BFS on the given side.
    pub bound: Option<BoundSide>,
    pub bound_join_col: ColumnIndex,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortOp {
    pub sort_cols: Vec<ColumnIndex>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByOp {
    /// (column, descending) keys in significance order.
    pub keys: Vec<(ColumnIndex, bool)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistinctOp {
    /// Columns the row identity is taken over.
    pub keep_cols: Vec<ColumnIndex>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOp {
    pub expression: Expression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindOp {
    pub expression: Expression,
    pub variable: Variable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub expression: Expression,
    pub output: Variable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupByOp {
    pub group_cols: Vec<ColumnIndex>,
    pub aggregates: Vec<AggregateSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionOp {
    /// For every output column, the source column in the left and right
    /// child; `None` columns are filled with `Undefined`.
    pub column_origins: Vec<[Option<ColumnIndex>; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValuesOp {
    pub variables: Vec<Variable>,
    pub rows: Vec<Vec<Option<Term>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WordScanOp {
    /// Word or `prefix*`.
    pub word: String,
    pub record_var: Variable,
    /// Present for prefix scans: the concrete matched word.
    pub match_var: Option<Variable>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityScanOp {
    pub record_var: Variable,
    pub entity: Endpoint,
    pub score_var: Variable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLimitOp {
    pub limit: u64,
    pub record_col: ColumnIndex,
    pub entity_cols: Vec<ColumnIndex>,
    pub score_cols: Vec<ColumnIndex>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitOffsetOp {
    pub limit: Option<u64>,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HasPredicateScanOp {
    /// Fixed subject; mutually exclusive with the other two forms.
    pub subject: Option<Id>,
    /// Free-subject form: scan all subjects into this variable.
    pub subject_var: Option<Variable>,
    /// Subtree form: child 0 provides the subjects in this column; the
    /// output is the child's columns plus the predicate column.
    pub child_subject_col: Option<ColumnIndex>,
    pub predicate_var: Variable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountPredicatesOp {
    /// Column of the child holding the subjects to count over; `None` means
    /// the full index (no child).
    pub subject_col: Option<ColumnIndex>,
    pub predicate_var: Variable,
    pub count_var: Variable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    IndexScan(IndexScanOp),
    Join(JoinOp),
    MultiColumnJoin(MultiColumnJoinOp),
    OptionalJoin(OptionalJoinOp),
    Minus(MinusOp),
    CartesianProduct,
    TransitivePath(TransitivePathOp),
    Sort(SortOp),
    OrderBy(OrderByOp),
    Distinct(DistinctOp),
    Filter(FilterOp),
    Bind(BindOp),
    GroupBy(GroupByOp),
    Union(UnionOp),
    Values(ValuesOp),
    WordScan(WordScanOp),
    EntityScan(EntityScanOp),
    TextLimit(TextLimitOp),
    LimitOffset(LimitOffsetOp),
    HasPredicateScan(HasPredicateScanOp),
    CountPredicates(CountPredicatesOp),
    /// The 1×0 identity table.
    NeutralElement,
}

impl Operator {
    /// Short human-readable name for logs and runtime information.
    pub fn descriptor(&self) -> &'static str {
        match self {
            Operator::IndexScan(_) => "IndexScan",
            Operator::Join(_) => "Join",
            Operator::MultiColumnJoin(_) => "MultiColumnJoin",
            Operator::OptionalJoin(_) => "OptionalJoin",
            Operator::Minus(_) => "Minus",
            Operator::CartesianProduct => "CartesianProduct",
            Operator::TransitivePath(_) => "TransitivePath",
            Operator::Sort(_) => "Sort",
            Operator::OrderBy(_) => "OrderBy",
            Operator::Distinct(_) => "Distinct",
            Operator::Filter(_) => "Filter",
            Operator::Bind(_) => "Bind",
            Operator::GroupBy(_) => "GroupBy",
            Operator::Union(_) => "Union",
            Operator::Values(_) => "Values",
            Operator::WordScan(_) => "WordScan",
            Operator::EntityScan(_) => "EntityScan",
            Operator::TextLimit(_) => "TextLimit",
            Operator::LimitOffset(_) => "LimitOffset",
            Operator::HasPredicateScan(_) => "HasPredicateScan",
            Operator::CountPredicates(_) => "CountPredicates",
            Operator::NeutralElement => "NeutralElement",
        }
    }
}
