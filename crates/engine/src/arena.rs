//! The plan arena: immutable operator nodes addressed by handle.
//!
//! Children are created before their parents, so every node's metadata
//! (width, variable map, sort order, estimates, cache key) is computed once
//! at insertion and is immutable afterwards. Candidate plans produced during
//! join enumeration share subtrees simply by sharing handles; nothing is ever
//! removed from an arena while planning.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{EngineResult, QueryError};
use crate::idtable::ColumnIndex;
use crate::operator::{Endpoint, Operator};
use crate::variable::{UndefStatus, Variable, VariableMap};
use index::Index;

/// Handle of one node in a [`PlanArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpHandle(pub u32);

#[derive(Debug)]
pub struct OpNode {
    pub op: Operator,
    pub children: SmallVec<[OpHandle; 2]>,
    pub var_map: VariableMap,
    /// Columns the output is guaranteed lex-sorted by (internal id order).
    pub sorted_on: Vec<ColumnIndex>,
    pub size_estimate: u64,
    pub cost_estimate: u64,
    /// Expected rows per distinct value, one entry per output column.
    pub multiplicities: Vec<f64>,
    pub known_empty: bool,
    /// Deterministic fingerprint: operator identity, parameters and the
    /// cache keys of all children. Equal keys imply equal results on the
    /// same index.
    pub cache_key: String,
    pub supports_lazy: bool,
    pub supports_limit: bool,
}

impl OpNode {
    pub fn width(&self) -> usize {
        self.var_map.num_columns()
    }

    /// Distinct-value estimate for one column.
    pub fn distinct_estimate(&self, column: ColumnIndex) -> u64 {
        let multiplicity = self.multiplicities.get(column).copied().unwrap_or(1.0);
        ((self.size_estimate as f64 / multiplicity.max(1.0)).ceil() as u64).max(1)
    }
}

#[derive(Debug)]
pub struct PlanArena {
    nodes: Vec<OpNode>,
    index: Arc<Index>,
    /// Sorts whose estimated input exceeds this row count are prohibitive
    /// (driven by `sort-estimate-cancellation-factor`).
    max_sort_rows: u64,
}

impl PlanArena {
    pub fn new(index: Arc<Index>) -> PlanArena {
        PlanArena {
            nodes: Vec::new(),
            index,
            max_sort_rows: u64::MAX,
        }
    }

    pub fn with_max_sort_rows(mut self, max_sort_rows: u64) -> PlanArena {
        self.max_sort_rows = max_sort_rows;
        self
    }

    pub fn max_sort_rows(&self) -> u64 {
        self.max_sort_rows
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn node(&self, handle: OpHandle) -> &OpNode {
        &self.nodes[handle.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert an operator with its children and compute all metadata.
    pub fn push(&mut self, op: Operator, children: &[OpHandle]) -> EngineResult<OpHandle> {
        let node = self.build_node(op, children)?;
        self.nodes.push(node);
        Ok(OpHandle((self.nodes.len() - 1) as u32))
    }

    fn child(&self, children: &[OpHandle], i: usize) -> EngineResult<&OpNode> {
        children
            .get(i)
            .map(|&h| self.node(h))
            .ok_or_else(|| QueryError::ContractViolation("operator is missing a child".into()))
    }

    fn build_node(&self, op: Operator, children: &[OpHandle]) -> EngineResult<OpNode> {
        let child_keys: Vec<&str> = children
            .iter()
            .map(|&h| self.node(h).cache_key.as_str())
            .collect();
        let child_costs: u64 = children
            .iter()
            .map(|&h| self.node(h).cost_estimate)
            .sum();
        let any_child_empty = children.iter().any(|&h| self.node(h).known_empty);

        let mut meta = match &op {
            Operator::IndexScan(scan) => self.meta_index_scan(scan),
            Operator::Join(join) => {
                let left = self.child(children, 0)?;
                let right = self.child(children, 1)?;
                meta_join(left, right, &[join.join_cols], &child_keys, "JOIN")
            }
            Operator::MultiColumnJoin(join) => {
                let left = self.child(children, 0)?;
                let right = self.child(children, 1)?;
                meta_join(left, right, &join.join_cols, &child_keys, "MULTI_COLUMN_JOIN")
            }
            Operator::OptionalJoin(join) => {
                let left = self.child(children, 0)?;
                let right = self.child(children, 1)?;
                meta_optional_join(left, right, &join.join_cols, &child_keys)
            }
            Operator::Minus(minus) => {
                let left = self.child(children, 0)?;
                let right = self.child(children, 1)?;
                meta_minus(left, right, &minus.join_cols, &child_keys)
            }
            Operator::CartesianProduct => self.meta_cartesian(children, &child_keys)?,
            Operator::TransitivePath(path) => self.meta_transitive(path, children, &child_keys)?,
            Operator::Sort(sort) => {
                let child = self.child(children, 0)?;
                let mut meta = meta_passthrough(child, &child_keys, "SORT", &sort.sort_cols);
                meta.sorted_on = sort.sort_cols.clone();
                meta.cost_extra = sort_cost(child.size_estimate);
                meta.supports_lazy = false;
                meta
            }
            Operator::OrderBy(order) => {
                let child = self.child(children, 0)?;
                let cols: Vec<ColumnIndex> = order.keys.iter().map(|&(c, _)| c).collect();
                let mut meta = meta_passthrough(child, &child_keys, "ORDER_BY", &cols);
                // Semantic order differs from internal id order.
                meta.sorted_on = Vec::new();
                meta.cost_extra = sort_cost(child.size_estimate);
                meta.supports_lazy = false;
                meta.cache_key = format!(
                    "ORDER_BY {:?} ({})",
                    order.keys,
                    child_keys.join(", ")
                );
                meta
            }
            Operator::Distinct(distinct) => {
                let child = self.child(children, 0)?;
                let mut meta =
                    meta_passthrough(child, &child_keys, "DISTINCT", &distinct.keep_cols);
                meta.size = (child.size_estimate / 2).max(1);
                meta
            }
            Operator::Filter(filter) => {
                let child = self.child(children, 0)?;
                let mut meta = meta_passthrough(child, &child_keys, "FILTER", &[]);
                meta.size = (child.size_estimate / 2).max(1);
                meta.cache_key =
                    format!("FILTER {} ({})", filter.expression, child_keys.join(", "));
                meta
            }
            Operator::Bind(bind) => {
                let child = self.child(children, 0)?;
                let mut var_map = child.var_map.clone();
                var_map.push(bind.variable.clone(), UndefStatus::PossiblyUndef);
                let mut multiplicities = child.multiplicities.clone();
                multiplicities.push(1.0);
                NodeMeta {
                    var_map,
                    sorted_on: child.sorted_on.clone(),
                    size: child.size_estimate,
                    cost_extra: 0,
                    multiplicities,
                    known_empty: false,
                    cache_key: format!(
                        "BIND {} AS {} ({})",
                        bind.expression,
                        bind.variable,
                        child_keys.join(", ")
                    ),
                    supports_lazy: true,
                    supports_limit: false,
                }
            }
            Operator::GroupBy(group) => {
                let child = self.child(children, 0)?;
                let mut var_map = VariableMap::new();
                for &col in &group.group_cols {
                    let var = child.var_map.var_at(col).ok_or_else(|| {
                        QueryError::ContractViolation("group column without variable".into())
                    })?;
                    var_map.push(var.clone(), child.var_map.undef_at(col));
                }
                for aggregate in &group.aggregates {
                    var_map.push(aggregate.output.clone(), UndefStatus::PossiblyUndef);
                }
                let width = var_map.num_columns();
                NodeMeta {
                    var_map,
                    sorted_on: (0..group.group_cols.len()).collect(),
                    size: (child.size_estimate / 2).max(1),
                    cost_extra: 0,
                    multiplicities: vec![1.0; width],
                    known_empty: child.known_empty && !group.group_cols.is_empty(),
                    cache_key: format!(
                        "GROUP_BY cols={:?} aggs={:?} ({})",
                        group.group_cols,
                        group
                            .aggregates
                            .iter()
                            .map(|a| format!("{} AS {}", a.expression, a.output))
                            .collect::<Vec<_>>(),
                        child_keys.join(", ")
                    ),
                    supports_lazy: true,
                    supports_limit: false,
                }
            }
            Operator::Union(union) => {
                let left = self.child(children, 0)?;
                let right = self.child(children, 1)?;
                let mut var_map = VariableMap::new();
                let mut multiplicities = Vec::new();
                for origins in &union.column_origins {
                    let (variable, undef) = match origins {
                        [Some(l), Some(r)] => (
                            left.var_map.var_at(*l).cloned(),
                            left.var_map.undef_at(*l).or(right.var_map.undef_at(*r)),
                        ),
                        [Some(l), None] => {
                            (left.var_map.var_at(*l).cloned(), UndefStatus::PossiblyUndef)
                        }
                        [None, Some(r)] => {
                            (right.var_map.var_at(*r).cloned(), UndefStatus::PossiblyUndef)
                        }
                        [None, None] => (None, UndefStatus::PossiblyUndef),
                    };
                    let variable = variable.ok_or_else(|| {
                        QueryError::ContractViolation("union column without origin".into())
                    })?;
                    var_map.push(variable, undef);
                    multiplicities.push(1.0);
                }
                NodeMeta {
                    var_map,
                    // Concatenation: no global sort order survives.
                    sorted_on: Vec::new(),
                    size: left.size_estimate + right.size_estimate,
                    cost_extra: 0,
                    multiplicities,
                    known_empty: left.known_empty && right.known_empty,
                    cache_key: format!(
                        "UNION {:?} ({})",
                        union.column_origins,
                        child_keys.join(", ")
                    ),
                    supports_lazy: true,
                    supports_limit: false,
                }
            }
            Operator::Values(values) => {
                let mut var_map = VariableMap::new();
                for variable in &values.variables {
                    let undef = if values
                        .rows
                        .iter()
                        .all(|row| row[var_map.num_columns()].is_some())
                    {
                        UndefStatus::AlwaysDefined
                    } else {
                        UndefStatus::PossiblyUndef
                    };
                    var_map.push(variable.clone(), undef);
                }
                let width = var_map.num_columns();
                NodeMeta {
                    var_map,
                    sorted_on: Vec::new(),
                    size: values.rows.len() as u64,
                    cost_extra: 0,
                    multiplicities: vec![1.0; width],
                    known_empty: values.rows.is_empty(),
                    cache_key: format!(
                        "VALUES vars={:?} rows={:?}",
                        values.variables.iter().map(|v| v.name()).collect::<Vec<_>>(),
                        values
                            .rows
                            .iter()
                            .map(|row| row
                                .iter()
                                .map(|t| t.as_ref().map(|t| t.to_string()))
                                .collect::<Vec<_>>())
                            .collect::<Vec<_>>()
                    ),
                    supports_lazy: false,
                    supports_limit: false,
                }
            }
            Operator::WordScan(scan) => {
                let mut var_map = VariableMap::new();
                var_map.push(scan.record_var.clone(), UndefStatus::AlwaysDefined);
                if let Some(match_var) = &scan.match_var {
                    var_map.push(match_var.clone(), UndefStatus::AlwaysDefined);
                }
                let size = self
                    .index
                    .text_index()
                    .map(|text| text.word_scan(&scan.word).len() as u64)
                    .unwrap_or(0);
                let width = var_map.num_columns();
                NodeMeta {
                    var_map,
                    sorted_on: (0..width).collect(),
                    size,
                    cost_extra: 0,
                    multiplicities: vec![1.0; width],
                    known_empty: size == 0,
                    cache_key: format!(
                        "WORD_SCAN {:?} record={} match={:?}",
                        scan.word,
                        scan.record_var,
                        scan.match_var.as_ref().map(Variable::name)
                    ),
                    supports_lazy: false,
                    supports_limit: false,
                }
            }
            Operator::EntityScan(scan) => {
                let mut var_map = VariableMap::new();
                var_map.push(scan.record_var.clone(), UndefStatus::AlwaysDefined);
                if let Endpoint::Var(entity_var) = &scan.entity {
                    var_map.push(entity_var.clone(), UndefStatus::AlwaysDefined);
                }
                var_map.push(scan.score_var.clone(), UndefStatus::AlwaysDefined);
                let size = self
                    .index
                    .text_index()
                    .map(|text| match &scan.entity {
                        Endpoint::Var(_) => text.entity_postings().len() as u64,
                        Endpoint::Fixed(id) => text.entity_scan(*id).len() as u64,
                    })
                    .unwrap_or(0);
                let sorted_width = var_map.num_columns() - 1;
                let width = var_map.num_columns();
                NodeMeta {
                    var_map,
                    // Sorted by (record [, entity]); the score column is not
                    // part of the sort order.
                    sorted_on: (0..sorted_width).collect(),
                    size,
                    cost_extra: 0,
                    multiplicities: vec![1.0; width],
                    known_empty: size == 0,
                    cache_key: format!(
                        "ENTITY_SCAN record={} entity={:?} score={}",
                        scan.record_var, scan.entity, scan.score_var
                    ),
                    supports_lazy: false,
                    supports_limit: false,
                }
            }
            Operator::TextLimit(limit) => {
                let child = self.child(children, 0)?;
                let mut meta = meta_passthrough(child, &child_keys, "TEXT_LIMIT", &[]);
                meta.sorted_on = limit.entity_cols.clone();
                meta.cost_extra = sort_cost(child.size_estimate);
                meta.supports_lazy = false;
                meta.cache_key = format!(
                    "TEXT_LIMIT n={} record={} entities={:?} scores={:?} ({})",
                    limit.limit,
                    limit.record_col,
                    limit.entity_cols,
                    limit.score_cols,
                    child_keys.join(", ")
                );
                meta
            }
            Operator::LimitOffset(limit) => {
                let child = self.child(children, 0)?;
                let mut meta = meta_passthrough(child, &child_keys, "LIMIT_OFFSET", &[]);
                let remaining = child.size_estimate.saturating_sub(limit.offset);
                meta.size = limit.limit.map_or(remaining, |l| remaining.min(l));
                meta.cache_key = format!(
                    "LIMIT {:?} OFFSET {} ({})",
                    limit.limit,
                    limit.offset,
                    child_keys.join(", ")
                );
                meta
            }
            Operator::HasPredicateScan(scan) => {
                let mut var_map = VariableMap::new();
                let sorted_on;
                let size;
                if scan.child_subject_col.is_some() {
                    // Subtree form: child columns plus the predicate column.
                    let child = self.child(children, 0)?;
                    for (variable, undef) in child.var_map.iter() {
                        var_map.push(variable.clone(), undef);
                    }
                    var_map.push(scan.predicate_var.clone(), UndefStatus::AlwaysDefined);
                    sorted_on = child.sorted_on.clone();
                    size = child.size_estimate.saturating_mul(2).max(1);
                } else {
                    if let Some(subject_var) = &scan.subject_var {
                        var_map.push(subject_var.clone(), UndefStatus::AlwaysDefined);
                    }
                    var_map.push(scan.predicate_var.clone(), UndefStatus::AlwaysDefined);
                    size = match scan.subject {
                        Some(subject) => self
                            .index
                            .predicates_of(subject)
                            .ok()
                            .flatten()
                            .map_or(0, |p| p.len() as u64)
                            .max(1),
                        None => self.index.num_triples().max(1) as u64,
                    };
                    sorted_on = (0..var_map.num_columns()).collect();
                }
                let width = var_map.num_columns();
                NodeMeta {
                    var_map,
                    sorted_on,
                    size,
                    cost_extra: 0,
                    multiplicities: vec![1.0; width],
                    known_empty: false,
                    cache_key: format!(
                        "HAS_PREDICATE_SCAN subject={:?} var={:?} childcol={:?} pred={} ({})",
                        scan.subject.map(|id| id.to_bits()),
                        scan.subject_var.as_ref().map(Variable::name),
                        scan.child_subject_col,
                        scan.predicate_var,
                        child_keys.join(", ")
                    ),
                    supports_lazy: false,
                    supports_limit: false,
                }
            }
            Operator::CountPredicates(count) => {
                let mut var_map = VariableMap::new();
                var_map.push(count.predicate_var.clone(), UndefStatus::AlwaysDefined);
                var_map.push(count.count_var.clone(), UndefStatus::AlwaysDefined);
                NodeMeta {
                    var_map,
                    sorted_on: Vec::new(),
                    size: self.index.num_distinct_predicates() as u64,
                    cost_extra: 0,
                    multiplicities: vec![1.0; 2],
                    known_empty: false,
                    cache_key: format!(
                        "COUNT_PREDICATES col={:?} ({})",
                        count.subject_col,
                        child_keys.join(", ")
                    ),
                    supports_lazy: false,
                    supports_limit: false,
                }
            }
            Operator::NeutralElement => NodeMeta {
                var_map: VariableMap::new(),
                sorted_on: Vec::new(),
                size: 1,
                cost_extra: 0,
                multiplicities: Vec::new(),
                known_empty: false,
                cache_key: "NEUTRAL_ELEMENT".to_string(),
                supports_lazy: false,
                supports_limit: false,
            },
        };

        if any_child_empty {
            meta.known_empty = matches!(
                op,
                Operator::Join(_)
                    | Operator::MultiColumnJoin(_)
                    | Operator::CartesianProduct
                    | Operator::Sort(_)
                    | Operator::OrderBy(_)
                    | Operator::Distinct(_)
                    | Operator::Filter(_)
                    | Operator::LimitOffset(_)
                    | Operator::TextLimit(_)
            ) || meta.known_empty;
        }

        Ok(OpNode {
            op,
            children: children.iter().copied().collect(),
            var_map: meta.var_map,
            sorted_on: meta.sorted_on,
            size_estimate: meta.size,
            cost_estimate: child_costs + meta.size + meta.cost_extra,
            multiplicities: meta.multiplicities,
            known_empty: meta.known_empty,
            cache_key: meta.cache_key,
            supports_lazy: meta.supports_lazy,
            supports_limit: meta.supports_limit,
        })
    }

    fn meta_index_scan(&self, scan: &crate::operator::IndexScanOp) -> NodeMeta {
        let order = scan.permutation.key_order();
        let num_bound = order
            .iter()
            .take_while(|&&pos| scan.fixed[pos].is_some())
            .count();
        let mut var_map = VariableMap::new();
        for &pos in order.iter().skip(num_bound) {
            if let Some(variable) = &scan.variables[pos] {
                var_map.push(variable.clone(), UndefStatus::AlwaysDefined);
            }
        }
        let width = var_map.num_columns();

        let (size, multiplicities) = self.scan_estimates(scan, num_bound, &order, width);
        let known_empty = scan.term_unknown
            || (num_bound >= 1
                && !self.index.col0_id_exists(
                    scan.permutation,
                    scan.fixed[order[0]].unwrap_or(rdf_model::Id::UNDEFINED),
                ));

        NodeMeta {
            var_map,
            sorted_on: (0..width).collect(),
            size,
            cost_extra: 0,
            multiplicities,
            known_empty,
            cache_key: format!(
                "SCAN {} fixed={:?} vars={:?}",
                scan.permutation,
                scan.fixed.map(|f| f.map(|id| id.to_bits())),
                scan.variables
                    .iter()
                    .map(|v| v.as_ref().map(Variable::name))
                    .collect::<Vec<_>>()
            ),
            supports_lazy: true,
            supports_limit: true,
        }
    }

    fn scan_estimates(
        &self,
        scan: &crate::operator::IndexScanOp,
        num_bound: usize,
        order: &[usize; 3],
        width: usize,
    ) -> (u64, Vec<f64>) {
        if scan.term_unknown {
            return (0, vec![1.0; width]);
        }
        match num_bound {
            0 => {
                let size = self.index.num_triples() as u64;
                let distinct = [
                    self.index.num_distinct_subjects(),
                    self.index.num_distinct_predicates(),
                    self.index.num_distinct_objects(),
                ];
                let multiplicities = order
                    .iter()
                    .map(|&pos| size as f64 / (distinct[pos].max(1)) as f64)
                    .collect();
                (size, multiplicities)
            }
            1 => {
                let col0 = scan.fixed[order[0]].unwrap_or(rdf_model::Id::UNDEFINED);
                match self.index.relation_metadata(scan.permutation, col0) {
                    Some(meta) => (
                        meta.num_rows,
                        vec![meta.multiplicity_col1, meta.multiplicity_col2],
                    ),
                    None => (0, vec![1.0; width]),
                }
            }
            2 => {
                let col0 = scan.fixed[order[0]].unwrap_or(rdf_model::Id::UNDEFINED);
                let size = self
                    .index
                    .relation_metadata(scan.permutation, col0)
                    .map_or(0, |meta| meta.multiplicity_col1.ceil() as u64);
                (size.max(1), vec![1.0; width])
            }
            _ => (1, Vec::new()),
        }
    }

    fn meta_cartesian(
        &self,
        children: &[OpHandle],
        child_keys: &[&str],
    ) -> EngineResult<NodeMeta> {
        if children.len() < 2 {
            return Err(QueryError::ContractViolation(
                "cartesian product needs at least two children".into(),
            ));
        }
        let mut var_map = VariableMap::new();
        let mut size: u64 = 1;
        for &handle in children {
            let child = self.node(handle);
            for (variable, undef) in child.var_map.iter() {
                if var_map.contains(variable) {
                    return Err(QueryError::ContractViolation(format!(
                        "cartesian product children share variable {variable}"
                    )));
                }
                var_map.push(variable.clone(), undef);
            }
            size = size.saturating_mul(child.size_estimate.max(1));
        }
        let width = var_map.num_columns();
        Ok(NodeMeta {
            var_map,
            // Output ordering is deliberately unspecified.
            sorted_on: Vec::new(),
            size,
            cost_extra: 0,
            multiplicities: vec![1.0; width],
            known_empty: false,
            cache_key: format!("CARTESIAN_PRODUCT ({})", child_keys.join(", ")),
            supports_lazy: true,
            supports_limit: true,
        })
    }

    fn meta_transitive(
        &self,
        path: &crate::operator::TransitivePathOp,
        children: &[OpHandle],
        child_keys: &[&str],
    ) -> EngineResult<NodeMeta> {
        let edges = self.child(children, 0)?;
        let mut var_map = VariableMap::new();
        let mut sorted_on = Vec::new();
        match path.bound {
            None => {
                if let Endpoint::Var(v) = &path.left {
                    var_map.push(v.clone(), UndefStatus::AlwaysDefined);
                }
                if let Endpoint::Var(v) = &path.right {
                    var_map.push(v.clone(), UndefStatus::AlwaysDefined);
                }
                if var_map.num_columns() > 0 {
                    // The output is sorted by its first column after the
                    // closing sort.
                    sorted_on.push(0);
                }
            }
            Some(side) => {
                let table = self.child(children, 1)?;
                for (variable, undef) in table.var_map.iter() {
                    var_map.push(variable.clone(), undef);
                }
                let free = match side {
                    crate::operator::BoundSide::Left => &path.right,
                    crate::operator::BoundSide::Right => &path.left,
                };
                if let Endpoint::Var(v) = free {
                    var_map.push(v.clone(), UndefStatus::AlwaysDefined);
                }
            }
        }
        let width = var_map.num_columns();
        let size = edges.size_estimate.saturating_mul(path.max.min(4).max(1));
        Ok(NodeMeta {
            var_map,
            sorted_on,
            size,
            cost_extra: size,
            multiplicities: vec![1.0; width],
            known_empty: edges.known_empty && path.min > 0,
            cache_key: format!(
                "TRANSITIVE_PATH min={} max={} left={:?} right={:?} bound={:?} joincol={} ({})",
                path.min,
                path.max,
                path.left,
                path.right,
                path.bound,
                path.bound_join_col,
                child_keys.join(", ")
            ),
            supports_lazy: false,
            supports_limit: false,
        })
    }
}

/// Intermediate metadata produced per operator before it is assembled into
/// an [`OpNode`].
struct NodeMeta {
    var_map: VariableMap,
    sorted_on: Vec<ColumnIndex>,
    size: u64,
    cost_extra: u64,
    multiplicities: Vec<f64>,
    known_empty: bool,
    cache_key: String,
    supports_lazy: bool,
    supports_limit: bool,
}

fn meta_passthrough(
    child: &OpNode,
    child_keys: &[&str],
    name: &str,
    cols: &[ColumnIndex],
) -> NodeMeta {
    NodeMeta {
        var_map: child.var_map.clone(),
        sorted_on: child.sorted_on.clone(),
        size: child.size_estimate,
        cost_extra: 0,
        multiplicities: child.multiplicities.clone(),
        known_empty: child.known_empty,
        cache_key: format!("{name} {cols:?} ({})", child_keys.join(", ")),
        supports_lazy: true,
        supports_limit: false,
    }
}

fn meta_join(
    left: &OpNode,
    right: &OpNode,
    join_cols: &[[ColumnIndex; 2]],
    child_keys: &[&str],
    name: &str,
) -> NodeMeta {
    // Output layout: join columns first, then the remaining left columns,
    // then the remaining right columns.
    let mut var_map = VariableMap::new();
    let mut multiplicities = Vec::new();
    let size = join_size_estimate(left, right, join_cols);
    for &[l, r] in join_cols {
        let variable = left
            .var_map
            .var_at(l)
            .cloned()
            .unwrap_or_else(|| Variable::new(format!("_join_{l}")));
        let undef = match (left.var_map.undef_at(l), right.var_map.undef_at(r)) {
            (UndefStatus::PossiblyUndef, UndefStatus::PossiblyUndef) => UndefStatus::PossiblyUndef,
            _ => UndefStatus::AlwaysDefined,
        };
        var_map.push(variable, undef);
        let dl = left.distinct_estimate(l);
        let dr = right.distinct_estimate(r);
        multiplicities.push(size as f64 / dl.min(dr).max(1) as f64);
    }
    let mut push_rest = |node: &OpNode, used: &dyn Fn(ColumnIndex) -> bool| {
        for (column, (variable, undef)) in node.var_map.iter().enumerate() {
            if !used(column) {
                var_map.push(variable.clone(), undef);
                let scale = size as f64 / node.size_estimate.max(1) as f64;
                multiplicities
                    .push((node.multiplicities.get(column).copied().unwrap_or(1.0) * scale).max(1.0));
            }
        }
    };
    push_rest(left, &|c| join_cols.iter().any(|jc| jc[0] == c));
    push_rest(right, &|c| join_cols.iter().any(|jc| jc[1] == c));

    NodeMeta {
        var_map,
        sorted_on: (0..join_cols.len()).collect(),
        size,
        cost_extra: 0,
        multiplicities,
        known_empty: left.known_empty || right.known_empty,
        cache_key: format!("{name} cols={join_cols:?} ({})", child_keys.join(", ")),
        supports_lazy: join_cols.len() == 1,
        supports_limit: false,
    }
}

fn meta_optional_join(
    left: &OpNode,
    right: &OpNode,
    join_cols: &[[ColumnIndex; 2]],
    child_keys: &[&str],
) -> NodeMeta {
    // Left columns keep their order; right-only columns are appended and may
    // be undefined.
    let mut var_map = VariableMap::new();
    for (_, (variable, undef)) in left.var_map.iter().enumerate() {
        var_map.push(variable.clone(), undef);
    }
    for (column, (variable, _)) in right.var_map.iter().enumerate() {
        if !join_cols.iter().any(|jc| jc[1] == column) {
            var_map.push(variable.clone(), UndefStatus::PossiblyUndef);
        }
    }
    let inner = join_size_estimate(left, right, join_cols);
    let size = inner.max(left.size_estimate);
    let width = var_map.num_columns();
    NodeMeta {
        var_map,
        sorted_on: join_cols.iter().map(|jc| jc[0]).collect(),
        size,
        cost_extra: 0,
        multiplicities: vec![1.0; width],
        known_empty: left.known_empty,
        cache_key: format!(
            "OPTIONAL_JOIN cols={join_cols:?} ({})",
            child_keys.join(", ")
        ),
        supports_lazy: false,
        supports_limit: false,
    }
}

fn meta_minus(
    left: &OpNode,
    right: &OpNode,
    join_cols: &[[ColumnIndex; 2]],
    child_keys: &[&str],
) -> NodeMeta {
    let _ = right;
    NodeMeta {
        var_map: left.var_map.clone(),
        sorted_on: left.sorted_on.clone(),
        // Upper bound: an arbitrary number of rows might be removed.
        size: left.size_estimate,
        cost_extra: 0,
        multiplicities: left.multiplicities.clone(),
        known_empty: left.known_empty,
        cache_key: format!("MINUS cols={join_cols:?} ({})", child_keys.join(", ")),
        supports_lazy: join_cols.len() == 1,
        supports_limit: false,
    }
}

fn join_size_estimate(left: &OpNode, right: &OpNode, join_cols: &[[ColumnIndex; 2]]) -> u64 {
    if join_cols.is_empty() {
        return left.size_estimate.saturating_mul(right.size_estimate);
    }
    let mut distinct_left = u64::MAX;
    let mut distinct_right = u64::MAX;
    for &[l, r] in join_cols {
        distinct_left = distinct_left.min(left.distinct_estimate(l));
        distinct_right = distinct_right.min(right.distinct_estimate(r));
    }
    let product = left.size_estimate.saturating_mul(right.size_estimate);
    (product / distinct_left.max(distinct_right).max(1)).max(1)
}

fn sort_cost(n: u64) -> u64 {
    let n = n.max(2);
    n.saturating_mul((n as f64).log2().ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{IndexScanOp, JoinOp, SortOp};
    use index::{IndexBuilder, IndexConfig, Permutation};
    use rdf_model::Term;

    fn test_index() -> Arc<Index> {
        let mut builder = IndexBuilder::new(IndexConfig::default());
        builder.add("<s>", "<p>", "<c>").unwrap();
        builder.add("<s>", "<p>", "<c2>").unwrap();
        builder.add("<s>", "<p2>", "<c>").unwrap();
        builder.add("<s2>", "<p2>", "<c2>").unwrap();
        Arc::new(builder.build().unwrap())
    }

    fn scan_op(index: &Index, predicate: &str, subject: &str, object: &str) -> Operator {
        let p = index.get_id(&Term::iri(predicate));
        Operator::IndexScan(IndexScanOp {
            permutation: Permutation::Pso,
            fixed: [None, p, None],
            variables: [
                Some(Variable::new(subject)),
                None,
                Some(Variable::new(object)),
            ],
            term_unknown: p.is_none(),
        })
    }

    #[test]
    fn index_scan_metadata() {
        let index = test_index();
        let mut arena = PlanArena::new(Arc::clone(&index));
        let scan = arena.push(scan_op(&index, "p", "x", "y"), &[]).unwrap();
        let node = arena.node(scan);
        assert_eq!(node.width(), 2);
        assert_eq!(node.sorted_on, vec![0, 1]);
        assert_eq!(node.size_estimate, 2);
        assert!(!node.known_empty);
        assert!(node.supports_lazy && node.supports_limit);
        assert_eq!(node.var_map.var_at(0), Some(&Variable::new("x")));
    }

    #[test]
    fn unknown_term_is_known_empty() {
        let index = test_index();
        let mut arena = PlanArena::new(Arc::clone(&index));
        let scan = arena
            .push(scan_op(&index, "no-such-predicate", "x", "y"), &[])
            .unwrap();
        assert!(arena.node(scan).known_empty);
    }

    #[test]
    fn join_layout_and_estimates() {
        let index = test_index();
        let mut arena = PlanArena::new(Arc::clone(&index));
        let left = arena.push(scan_op(&index, "p", "x", "y"), &[]).unwrap();
        let right = arena.push(scan_op(&index, "p2", "x", "z"), &[]).unwrap();
        let join = arena
            .push(Operator::Join(JoinOp { join_cols: [0, 0] }), &[left, right])
            .unwrap();
        let node = arena.node(join);
        // join col ?x first, then ?y, then ?z.
        assert_eq!(
            node.var_map.variables().collect::<Vec<_>>(),
            vec![
                &Variable::new("x"),
                &Variable::new("y"),
                &Variable::new("z")
            ]
        );
        assert_eq!(node.sorted_on, vec![0]);
        assert!(node.size_estimate >= 1);
        assert!(node.cost_estimate >= node.size_estimate);
    }

    #[test]
    fn cache_keys_deterministic_and_structural() {
        let index = test_index();
        let mut arena = PlanArena::new(Arc::clone(&index));
        let a1 = arena.push(scan_op(&index, "p", "x", "y"), &[]).unwrap();
        let a2 = arena.push(scan_op(&index, "p", "x", "y"), &[]).unwrap();
        let b = arena.push(scan_op(&index, "p2", "x", "y"), &[]).unwrap();
        assert_eq!(arena.node(a1).cache_key, arena.node(a2).cache_key);
        assert_ne!(arena.node(a1).cache_key, arena.node(b).cache_key);
        let sort = arena
            .push(
                Operator::Sort(SortOp {
                    sort_cols: vec![1, 0],
                }),
                &[a1],
            )
            .unwrap();
        assert!(arena.node(sort).cache_key.contains(&arena.node(a1).cache_key));
        assert_eq!(arena.node(sort).sorted_on, vec![1, 0]);
    }
}
