//! Candidate plans and their combination.
//!
//! A [`SubtreePlan`] is one candidate physical tree annotated with three
//! 64-bit masks: the triple-graph nodes it covers, the filters it has
//! applied and the text limits it has applied. Two plans combine only if
//! their node masks are disjoint and they share at least one variable.

use smallvec::SmallVec;

use crate::arena::{OpHandle, PlanArena};
use crate::error::{EngineResult, QueryError};
use crate::expression::Expression;
use crate::idtable::ColumnIndex;
use crate::operator::{
    BoundSide, Endpoint, FilterOp, JoinOp, MinusOp, MultiColumnJoinOp, Operator, OptionalJoinOp,
    SortOp, TextLimitOp, UnionOp,
};
use crate::variable::Variable;

/// How a plan composes with its left sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Basic,
    Optional,
    Minus,
}

#[derive(Debug, Clone, Copy)]
pub struct SubtreePlan {
    pub handle: OpHandle,
    /// One bit per covered triple-graph node.
    pub nodes: u64,
    /// One bit per applied filter.
    pub filters: u64,
    /// One bit per applied text limit.
    pub text_limits: u64,
    pub plan_type: PlanType,
}

impl SubtreePlan {
    pub fn seed(handle: OpHandle, node: usize) -> SubtreePlan {
        SubtreePlan {
            handle,
            nodes: 1u64 << node,
            filters: 0,
            text_limits: 0,
            plan_type: PlanType::Basic,
        }
    }

    pub fn with_type(mut self, plan_type: PlanType) -> SubtreePlan {
        self.plan_type = plan_type;
        self
    }
}

/// The deduplication fingerprint of a candidate plan.
fn pruning_key(arena: &PlanArena, plan: &SubtreePlan) -> String {
    let node = arena.node(plan.handle);
    let sorted_vars: Vec<&str> = node
        .sorted_on
        .iter()
        .filter_map(|&c| node.var_map.var_at(c).map(Variable::name))
        .collect();
    format!(
        "{:?} n:{} f:{} t:{}",
        sorted_vars, plan.nodes, plan.filters, plan.text_limits
    )
}

/// Keep only the cheapest plan per pruning key. Cost ties break on the
/// cache-key string in test mode for full determinism.
pub fn prune(arena: &PlanArena, row: &mut Vec<SubtreePlan>, test_mode: bool) {
    let mut best: rustc_hash::FxHashMap<String, SubtreePlan> = rustc_hash::FxHashMap::default();
    for plan in row.drain(..) {
        let key = pruning_key(arena, &plan);
        match best.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(plan);
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let current = slot.get();
                let (new_cost, old_cost) = (
                    arena.node(plan.handle).cost_estimate,
                    arena.node(current.handle).cost_estimate,
                );
                let replace = new_cost < old_cost
                    || (test_mode
                        && new_cost == old_cost
                        && arena.node(plan.handle).cache_key
                            < arena.node(current.handle).cache_key);
                if replace {
                    slot.insert(plan);
                }
            }
        }
    }
    row.extend(best.into_values());
    // Deterministic row order regardless of hash-map iteration.
    row.sort_by(|a, b| {
        (a.nodes, a.filters, a.text_limits, a.handle).cmp(&(
            b.nodes,
            b.filters,
            b.text_limits,
            b.handle,
        ))
    });
}

pub fn cheapest(arena: &PlanArena, row: &[SubtreePlan], test_mode: bool) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, plan) in row.iter().enumerate() {
        let better = match best {
            None => true,
            Some(b) => {
                let (cost, best_cost) = (
                    arena.node(plan.handle).cost_estimate,
                    arena.node(row[b].handle).cost_estimate,
                );
                cost < best_cost
                    || (test_mode
                        && cost == best_cost
                        && arena.node(plan.handle).cache_key
                            < arena.node(row[b].handle).cache_key)
            }
        };
        if better {
            best = Some(i);
        }
    }
    best
}

/// Wrap `plan` in a `Sort` unless its output already starts with `cols`.
/// A sort whose estimated input exceeds the configured maximum is treated
/// as prohibitive.
pub fn sorted_by(
    arena: &mut PlanArena,
    handle: OpHandle,
    cols: &[ColumnIndex],
) -> EngineResult<OpHandle> {
    if arena.node(handle).sorted_on.starts_with(cols) {
        return Ok(handle);
    }
    let size = arena.node(handle).size_estimate;
    if size > arena.max_sort_rows() {
        return Err(QueryError::UnsupportedFeature(format!(
            "sorting an estimated {size} rows exceeds the sort estimate limit"
        )));
    }
    arena.push(
        Operator::Sort(SortOp {
            sort_cols: cols.to_vec(),
        }),
        &[handle],
    )
}

/// Like [`sorted_by`], but a prohibitive sort drops the candidate instead
/// of failing the whole planning run.
fn try_sorted(
    arena: &mut PlanArena,
    handle: OpHandle,
    cols: &[ColumnIndex],
) -> EngineResult<Option<OpHandle>> {
    match sorted_by(arena, handle, cols) {
        Ok(handle) => Ok(Some(handle)),
        Err(QueryError::UnsupportedFeature(_)) => Ok(None),
        Err(error) => Err(error),
    }
}

/// Join columns between two plans: all shared variables, ordered by the
/// left plan's columns.
pub fn join_columns(
    arena: &PlanArena,
    a: &SubtreePlan,
    b: &SubtreePlan,
) -> Vec<[ColumnIndex; 2]> {
    arena
        .node(a.handle)
        .var_map
        .join_columns(&arena.node(b.handle).var_map)
}

fn merged_masks(a: &SubtreePlan, b: &SubtreePlan, handle: OpHandle) -> SubtreePlan {
    SubtreePlan {
        handle,
        nodes: a.nodes | b.nodes,
        filters: a.filters | b.filters,
        text_limits: a.text_limits | b.text_limits,
        plan_type: PlanType::Basic,
    }
}

/// All ways to combine two disjoint, variable-sharing plans.
pub fn create_join_candidates(
    arena: &mut PlanArena,
    a_in: &SubtreePlan,
    b_in: &SubtreePlan,
    test_mode: bool,
) -> EngineResult<Vec<SubtreePlan>> {
    if (a_in.nodes & b_in.nodes) != 0 {
        return Ok(Vec::new());
    }
    // Deterministic operand order in test mode.
    let swap_for_testing = test_mode
        && b_in.plan_type == PlanType::Basic
        && a_in.plan_type == PlanType::Basic
        && arena.node(a_in.handle).cache_key > arena.node(b_in.handle).cache_key;
    let (mut a, mut b) = if swap_for_testing {
        (*b_in, *a_in)
    } else {
        (*a_in, *b_in)
    };
    // OPTIONAL and MINUS compose only as the right operand.
    if a.plan_type != PlanType::Basic {
        if b.plan_type != PlanType::Basic {
            return Ok(Vec::new());
        }
        std::mem::swap(&mut a, &mut b);
    }

    let jcs = join_columns(arena, &a, &b);
    if jcs.is_empty() {
        return Ok(Vec::new());
    }

    if b.plan_type == PlanType::Minus {
        let l_cols: Vec<ColumnIndex> = jcs.iter().map(|jc| jc[0]).collect();
        let r_cols: Vec<ColumnIndex> = jcs.iter().map(|jc| jc[1]).collect();
        let (Some(left), Some(right)) = (
            try_sorted(arena, a.handle, &l_cols)?,
            try_sorted(arena, b.handle, &r_cols)?,
        ) else {
            return Ok(Vec::new());
        };
        let handle = arena.push(
            Operator::Minus(MinusOp {
                join_cols: jcs.clone(),
            }),
            &[left, right],
        )?;
        return Ok(vec![merged_masks(&a, &b, handle)]);
    }

    if b.plan_type == PlanType::Optional {
        let l_cols: Vec<ColumnIndex> = jcs.iter().map(|jc| jc[0]).collect();
        let r_cols: Vec<ColumnIndex> = jcs.iter().map(|jc| jc[1]).collect();
        let (Some(left), Some(right)) = (
            try_sorted(arena, a.handle, &l_cols)?,
            try_sorted(arena, b.handle, &r_cols)?,
        ) else {
            return Ok(Vec::new());
        };
        let handle = arena.push(
            Operator::OptionalJoin(OptionalJoinOp {
                join_cols: jcs.clone(),
            }),
            &[left, right],
        )?;
        return Ok(vec![merged_masks(&a, &b, handle)]);
    }

    let mut candidates = Vec::new();

    // Bind an unbound transitive path to the other side instead of fully
    // materializing the unbound closure.
    if let Some(plan) = bind_transitive_path(arena, &a, &b)? {
        candidates.push(plan);
        return Ok(candidates);
    }

    // Push the join into both branches of a union when the other side is an
    // unbound transitive path.
    if let Some(plan) = distribute_join_over_union(arena, &a, &b, test_mode)? {
        candidates.push(plan);
        return Ok(candidates);
    }

    // Answer a join on the subject of a free has-predicate scan from the
    // pattern data directly.
    if let Some(plan) = specialize_has_predicate(arena, &a, &b)? {
        candidates.push(plan);
    }

    if jcs.len() >= 2 {
        let l_cols: Vec<ColumnIndex> = jcs.iter().map(|jc| jc[0]).collect();
        let r_cols: Vec<ColumnIndex> = jcs.iter().map(|jc| jc[1]).collect();
        if let (Some(left), Some(right)) = (
            try_sorted(arena, a.handle, &l_cols)?,
            try_sorted(arena, b.handle, &r_cols)?,
        ) {
            let handle = arena.push(
                Operator::MultiColumnJoin(MultiColumnJoinOp { join_cols: jcs }),
                &[left, right],
            )?;
            candidates.push(merged_masks(&a, &b, handle));
        }
        return Ok(candidates);
    }

    let [l_col, r_col] = jcs[0];
    if let (Some(left), Some(right)) = (
        try_sorted(arena, a.handle, &[l_col])?,
        try_sorted(arena, b.handle, &[r_col])?,
    ) {
        // Columns keep their index through a Sort, so the join columns
        // carry over unchanged.
        let handle =
            arena.push(Operator::Join(JoinOp { join_cols: jcs[0] }), &[left, right])?;
        candidates.push(merged_masks(&a, &b, handle));
    }
    Ok(candidates)
}

/// If `a` or `b` is an unbound transitive path joined on one endpoint,
/// produce the bound form seeded by the other side.
fn bind_transitive_path(
    arena: &mut PlanArena,
    a: &SubtreePlan,
    b: &SubtreePlan,
) -> EngineResult<Option<SubtreePlan>> {
    for (path_plan, side_plan) in [(b, a), (a, b)] {
        let Operator::TransitivePath(op) = &arena.node(path_plan.handle).op else {
            continue;
        };
        if op.bound.is_some() {
            continue;
        }
        let op = op.clone();
        let jcs = join_columns(arena, side_plan, path_plan);
        if jcs.len() != 1 {
            continue;
        }
        let path_node = arena.node(path_plan.handle);
        let joined_var = path_node.var_map.var_at(jcs[0][1]).cloned();
        let Some(joined_var) = joined_var else { continue };
        let bound_side = match (&op.left, &op.right) {
            (Endpoint::Var(v), _) if *v == joined_var => BoundSide::Left,
            (_, Endpoint::Var(v)) if *v == joined_var => BoundSide::Right,
            _ => continue,
        };
        let edges = arena.node(path_plan.handle).children[0];
        let bound_op = crate::operator::TransitivePathOp {
            min: op.min,
            max: op.max,
            left: op.left.clone(),
            right: op.right.clone(),
            bound: Some(bound_side),
            bound_join_col: jcs[0][0],
        };
        let handle = arena.push(
            Operator::TransitivePath(bound_op),
            &[edges, side_plan.handle],
        )?;
        return Ok(Some(merged_masks(a, b, handle)));
    }
    Ok(None)
}

/// Distribute a join over a union: `(l UNION r) JOIN x` becomes
/// `(l JOIN x) UNION (r JOIN x)` when `x` is an unbound transitive path
/// (which profits from being bound per branch).
fn distribute_join_over_union(
    arena: &mut PlanArena,
    a: &SubtreePlan,
    b: &SubtreePlan,
    test_mode: bool,
) -> EngineResult<Option<SubtreePlan>> {
    for (union_plan, other_plan) in [(a, b), (b, a)] {
        if !matches!(arena.node(union_plan.handle).op, Operator::Union(_)) {
            continue;
        }
        let is_unbound_path = matches!(
            &arena.node(other_plan.handle).op,
            Operator::TransitivePath(op) if op.bound.is_none()
        );
        if !is_unbound_path {
            continue;
        }
        let children: SmallVec<[OpHandle; 2]> = arena.node(union_plan.handle).children.clone();
        let mut branch_plans = Vec::new();
        for &branch in &children {
            let branch_as_plan = SubtreePlan {
                handle: branch,
                nodes: union_plan.nodes,
                filters: union_plan.filters,
                text_limits: union_plan.text_limits,
                plan_type: PlanType::Basic,
            };
            let mut joined =
                create_join_candidates(arena, &branch_as_plan, other_plan, test_mode)?;
            let Some(best) = cheapest(arena, &joined, test_mode) else {
                return Ok(None);
            };
            branch_plans.push(joined.swap_remove(best));
        }
        let [left, right] = [branch_plans[0].handle, branch_plans[1].handle];
        // Harmonize the two branch layouts by variable name.
        let left_vars: Vec<Variable> = arena
            .node(left)
            .var_map
            .variables()
            .cloned()
            .collect();
        let mut origins = Vec::with_capacity(left_vars.len());
        for (i, variable) in left_vars.iter().enumerate() {
            origins.push([Some(i), arena.node(right).var_map.column_of(variable)]);
        }
        for (i, variable) in arena
            .node(right)
            .var_map
            .variables()
            .cloned()
            .collect::<Vec<_>>()
            .iter()
            .enumerate()
        {
            if !left_vars.contains(variable) {
                origins.push([None, Some(i)]);
            }
        }
        let handle = arena.push(
            Operator::Union(UnionOp {
                column_origins: origins,
            }),
            &[left, right],
        )?;
        return Ok(Some(merged_masks(a, b, handle)));
    }
    Ok(None)
}

/// When one side is a free has-predicate scan joined on its subject column,
/// answer the join from the pattern data instead of the full relation.
fn specialize_has_predicate(
    arena: &mut PlanArena,
    a: &SubtreePlan,
    b: &SubtreePlan,
) -> EngineResult<Option<SubtreePlan>> {
    for (scan_plan, side_plan) in [(b, a), (a, b)] {
        let Operator::HasPredicateScan(op) = &arena.node(scan_plan.handle).op else {
            continue;
        };
        if op.subject_var.is_none() || op.child_subject_col.is_some() {
            continue;
        }
        let op = op.clone();
        let jcs = join_columns(arena, side_plan, scan_plan);
        // Only a pure subject join qualifies (the subject is column 0 of the
        // free scan).
        if jcs.len() != 1 || jcs[0][1] != 0 {
            continue;
        }
        let handle = arena.push(
            Operator::HasPredicateScan(crate::operator::HasPredicateScanOp {
                subject: None,
                subject_var: None,
                child_subject_col: Some(jcs[0][0]),
                predicate_var: op.predicate_var.clone(),
            }),
            &[side_plan.handle],
        )?;
        return Ok(Some(merged_masks(a, b, handle)));
    }
    Ok(None)
}

/// Combine every eligible pair of two rows.
pub fn merge_rows(
    arena: &mut PlanArena,
    row_a: &[SubtreePlan],
    row_b: &[SubtreePlan],
    test_mode: bool,
) -> EngineResult<Vec<SubtreePlan>> {
    let mut out = Vec::new();
    for a in row_a {
        for b in row_b {
            out.extend(create_join_candidates(arena, a, b, test_mode)?);
        }
    }
    prune(arena, &mut out, test_mode);
    Ok(out)
}

/// Apply every filter whose variables are all covered, tracking application
/// in the filter mask. With `replace`, plans are updated in place (used for
/// the final row); otherwise filtered variants are added alongside.
pub fn apply_filters(
    arena: &mut PlanArena,
    row: &mut Vec<SubtreePlan>,
    filters: &[Expression],
    replace: bool,
) -> EngineResult<()> {
    if filters.len() > super::triple_graph::MAX_NODES {
        return Err(QueryError::UnsupportedFeature(format!(
            "At most {} filters per group are supported",
            super::triple_graph::MAX_NODES
        )));
    }
    let mut added = Vec::new();
    for plan in row.iter_mut() {
        for (i, filter) in filters.iter().enumerate() {
            if (plan.filters >> i) & 1 != 0 {
                continue;
            }
            let covered = filter
                .variables()
                .iter()
                .all(|&v| arena.node(plan.handle).var_map.contains(v));
            if !covered {
                continue;
            }
            let handle = arena.push(
                Operator::Filter(FilterOp {
                    expression: filter.clone(),
                }),
                &[plan.handle],
            )?;
            let new_plan = SubtreePlan {
                handle,
                nodes: plan.nodes,
                filters: plan.filters | (1u64 << i),
                text_limits: plan.text_limits,
                plan_type: plan.plan_type,
            };
            if replace {
                *plan = new_plan;
            } else {
                added.push(new_plan);
            }
        }
    }
    row.extend(added);
    Ok(())
}

/// One pending text limit: the entity/score columns of a text record
/// variable plus the nodes that must be part of a plan before the limit may
/// be applied.
#[derive(Debug, Clone)]
pub struct TextLimitSpec {
    pub record_var: Variable,
    pub entity_vars: Vec<Variable>,
    pub score_vars: Vec<Variable>,
    pub must_finish: u64,
}

pub fn apply_text_limits(
    arena: &mut PlanArena,
    row: &mut Vec<SubtreePlan>,
    limits: &[TextLimitSpec],
    limit: u64,
    replace: bool,
) -> EngineResult<()> {
    let mut added = Vec::new();
    for plan in row.iter_mut() {
        for (i, spec) in limits.iter().enumerate() {
            if (plan.text_limits >> i) & 1 != 0 {
                continue;
            }
            if (plan.nodes & spec.must_finish) != spec.must_finish {
                // An operation feeding this text record variable is still
                // missing.
                continue;
            }
            let var_map = &arena.node(plan.handle).var_map;
            let Some(record_col) = var_map.column_of(&spec.record_var) else {
                continue;
            };
            let cols = |vars: &[Variable]| -> Option<Vec<ColumnIndex>> {
                vars.iter().map(|v| var_map.column_of(v)).collect()
            };
            let (Some(entity_cols), Some(score_cols)) =
                (cols(&spec.entity_vars), cols(&spec.score_vars))
            else {
                continue;
            };
            let handle = arena.push(
                Operator::TextLimit(TextLimitOp {
                    limit,
                    record_col,
                    entity_cols,
                    score_cols,
                }),
                &[plan.handle],
            )?;
            let new_plan = SubtreePlan {
                handle,
                nodes: plan.nodes,
                filters: plan.filters,
                text_limits: plan.text_limits | (1u64 << i),
                plan_type: plan.plan_type,
            };
            if replace {
                *plan = new_plan;
            } else {
                added.push(new_plan);
            }
        }
    }
    row.extend(added);
    Ok(())
}
