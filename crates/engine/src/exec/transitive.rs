//! Transitive path evaluation (reflexive-transitive closure with bounds).

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashSet;
use rdf_model::Id;
use rustc_hash::FxHashMap;

use crate::arena::{OpHandle, OpNode};
use crate::cancellation::CancellationTicker;
use crate::error::{EngineResult, QueryError};
use crate::idtable::IdTable;
use crate::operator::{BoundSide, Endpoint, TransitivePathOp};
use crate::result::QueryResult;

use super::Evaluator;

/// Edge map from node to successors.
type Adjacency = FxHashMap<Id, Vec<Id>>;

fn build_adjacency(
    edges: &IdTable,
    reversed: bool,
) -> (Adjacency, Vec<Id>) {
    let mut adjacency: Adjacency = FxHashMap::default();
    let mut nodes: AHashSet<Id> = AHashSet::new();
    for row in 0..edges.num_rows() {
        let (from, to) = if reversed {
            (edges.at(row, 1), edges.at(row, 0))
        } else {
            (edges.at(row, 0), edges.at(row, 1))
        };
        adjacency.entry(from).or_default().push(to);
        nodes.insert(from);
        nodes.insert(to);
    }
    let mut all: Vec<Id> = nodes.into_iter().collect();
    all.sort_unstable();
    (adjacency, all)
}

/// All nodes reachable from `source` within `[min, max]` steps, deduplicated
/// per (source, target).
fn bfs_reachable(
    adjacency: &Adjacency,
    source: Id,
    min: u64,
    max: u64,
    ticker: &mut CancellationTicker,
) -> EngineResult<Vec<Id>> {
    let mut reached: Vec<Id> = Vec::new();
    let mut seen: AHashSet<Id> = AHashSet::new();
    let mut queue: VecDeque<(Id, u64)> = VecDeque::new();
    seen.insert(source);
    queue.push_back((source, 0));
    if min == 0 {
        reached.push(source);
    }
    while let Some((node, depth)) = queue.pop_front() {
        ticker.tick()?;
        if depth >= max {
            continue;
        }
        if let Some(successors) = adjacency.get(&node) {
            for &next in successors {
                if seen.insert(next) {
                    if depth + 1 >= min {
                        reached.push(next);
                    }
                    queue.push_back((next, depth + 1));
                }
            }
        }
    }
    Ok(reached)
}

pub(super) fn compute(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &TransitivePathOp,
) -> EngineResult<QueryResult> {
    let edges = eval.materialize(node.children[0], None)?;
    if edges.table.num_columns() < 2 {
        return Err(QueryError::ContractViolation(
            "transitive path needs a two-column edge input".into(),
        ));
    }
    let mut ticker = CancellationTicker::new(
        Arc::clone(&eval.ctx.cancellation),
        "computing transitive path",
    );

    match op.bound {
        Some(side) => {
            // Seeds come from the side table; each of its rows is extended
            // by the nodes its seed reaches.
            let table = eval.materialize(node.children[1], None)?;
            let reversed = side == BoundSide::Right;
            let (adjacency, _) = build_adjacency(&edges.table, reversed);
            let free = match side {
                BoundSide::Left => &op.right,
                BoundSide::Right => &op.left,
            };
            let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
            let mut cache: FxHashMap<Id, Vec<Id>> = FxHashMap::default();
            for row in 0..table.table.num_rows() {
                ticker.tick()?;
                let seed = table.table.at(row, op.bound_join_col);
                if !cache.contains_key(&seed) {
                    let reached = bfs_reachable(&adjacency, seed, op.min, op.max, &mut ticker)?;
                    cache.insert(seed, reached);
                }
                let base = table.table.row_vec(row);
                match free {
                    Endpoint::Var(_) => {
                        for target in &cache[&seed] {
                            let mut values = base.clone();
                            values.push(*target);
                            out.push_row(&values)?;
                        }
                    }
                    Endpoint::Fixed(expected) => {
                        if cache[&seed].contains(expected) {
                            out.push_row(&base)?;
                        }
                    }
                }
            }
            Ok(QueryResult::materialized(
                out,
                node.sorted_on.clone(),
                (*table.vocab).clone(),
            ))
        }
        None => {
            let (forward, all_nodes) = build_adjacency(&edges.table, false);
            let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
            match (&op.left, &op.right) {
                (Endpoint::Fixed(source), right) => {
                    let reached =
                        bfs_reachable(&forward, *source, op.min, op.max, &mut ticker)?;
                    for target in reached {
                        match right {
                            Endpoint::Var(_) => out.push_row(&[target])?,
                            Endpoint::Fixed(expected) => {
                                if target == *expected {
                                    out.push_row(&[])?;
                                }
                            }
                        }
                    }
                }
                (Endpoint::Var(_), Endpoint::Fixed(target)) => {
                    // BFS backwards from the fixed right endpoint.
                    let (backward, _) = build_adjacency(&edges.table, true);
                    let reached =
                        bfs_reachable(&backward, *target, op.min, op.max, &mut ticker)?;
                    for source in reached {
                        out.push_row(&[source])?;
                    }
                }
                (Endpoint::Var(_), Endpoint::Var(_)) => {
                    // Fully unbound: BFS from every node in the edge set.
                    for &source in &all_nodes {
                        let reached =
                            bfs_reachable(&forward, source, op.min, op.max, &mut ticker)?;
                        for target in reached {
                            out.push_row(&[source, target])?;
                        }
                    }
                }
            }
            if node.width() > 0 {
                out.sort_by_columns(&[0]);
            }
            Ok(QueryResult::materialized(
                out,
                node.sorted_on.clone(),
                (*edges.vocab).clone(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::PlanArena;
    use crate::context::QueryContext;
    use crate::operator::{IndexScanOp, Operator};
    use crate::variable::Variable;
    use index::{IndexBuilder, IndexConfig, Permutation};
    use rdf_model::Term;

    fn context() -> QueryContext {
        let mut builder = IndexBuilder::new(IndexConfig::default());
        builder.add("<a>", "<edge>", "<b>").unwrap();
        builder.add("<b>", "<edge>", "<c>").unwrap();
        builder.add("<c>", "<edge>", "<d>").unwrap();
        QueryContext::new(Arc::new(builder.build().unwrap()))
    }

    fn edge_scan(ctx: &QueryContext) -> Operator {
        let p = ctx.index.get_id(&Term::iri("edge"));
        Operator::IndexScan(IndexScanOp {
            permutation: Permutation::Pso,
            fixed: [None, p, None],
            variables: [
                Some(Variable::new("_start")),
                None,
                Some(Variable::new("_end")),
            ],
            term_unknown: p.is_none(),
        })
    }

    fn path(ctx: &QueryContext, min: u64, max: u64, left: Endpoint, right: Endpoint) -> QueryResult {
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let edges = arena.push(edge_scan(ctx), &[]).unwrap();
        let path = arena
            .push(
                Operator::TransitivePath(TransitivePathOp {
                    min,
                    max,
                    left,
                    right,
                    bound: None,
                    bound_join_col: 0,
                }),
                &[edges],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        eval.evaluate(path, false, None).unwrap()
    }

    #[test]
    fn one_or_more_from_fixed_source() {
        let ctx = context();
        let a = ctx.index.get_id(&Term::iri("a")).unwrap();
        let result = path(
            &ctx,
            1,
            u64::MAX,
            Endpoint::Fixed(a),
            Endpoint::Var(Variable::new("y")),
        )
        .into_materialized(&ctx.memory)
        .unwrap();
        // a reaches b, c, d.
        assert_eq!(result.table.num_rows(), 3);
    }

    #[test]
    fn bounded_length_limits_closure() {
        let ctx = context();
        let a = ctx.index.get_id(&Term::iri("a")).unwrap();
        let result = path(
            &ctx,
            1,
            2,
            Endpoint::Fixed(a),
            Endpoint::Var(Variable::new("y")),
        )
        .into_materialized(&ctx.memory)
        .unwrap();
        // Within two steps: b and c.
        assert_eq!(result.table.num_rows(), 2);
    }

    #[test]
    fn zero_or_more_includes_reflexive_pairs() {
        let ctx = context();
        let result = path(
            &ctx,
            0,
            u64::MAX,
            Endpoint::Var(Variable::new("x")),
            Endpoint::Var(Variable::new("y")),
        )
        .into_materialized(&ctx.memory)
        .unwrap();
        // 4 reflexive pairs + a->{b,c,d} + b->{c,d} + c->{d}.
        assert_eq!(result.table.num_rows(), 10);
        assert!(result.table.is_sorted_by(&[0]));
    }
}
