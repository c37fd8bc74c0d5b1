//! Limit/offset application, has-predicate scans and the pattern-trick
//! counting operator.

use std::sync::Arc;

use rdf_model::{Id, LocalVocab};
use rustc_hash::FxHashMap;

use crate::arena::{OpHandle, OpNode};
use crate::cancellation::CancellationTicker;
use crate::error::EngineResult;
use crate::idtable::IdTable;
use crate::operator::{CountPredicatesOp, HasPredicateScanOp, LimitOffsetOp};
use crate::result::{Block, LazyResult, QueryResult};

use super::Evaluator;

pub(super) fn compute_limit_offset(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &LimitOffsetOp,
    request_lazy: bool,
) -> EngineResult<QueryResult> {
    let child_h = node.children[0];
    let child_node = eval.node(child_h);

    // Zero-offset limits are pushed into children with native support
    // (index scans truncate at block level, the cartesian product bounds
    // its fill loop).
    let hint = match (op.limit, op.offset) {
        (Some(limit), 0) if child_node.supports_limit => Some(limit as usize),
        _ => None,
    };

    let child = eval.evaluate(child_h, request_lazy, hint)?;
    match child {
        QueryResult::Lazy(mut lazy) => {
            let mut stream = lazy.take_stream()?;
            let sorted_on = node.sorted_on.clone();
            let mut to_skip = op.offset as usize;
            let mut remaining = op.limit.map(|l| l as usize);
            let ctx = eval.ctx.clone();
            // Stops pulling from the child as soon as the limit is reached.
            let mapped = std::iter::from_fn(move || loop {
                if remaining == Some(0) {
                    return None;
                }
                let block = match stream.next()? {
                    Ok(block) => block,
                    Err(error) => return Some(Err(error)),
                };
                if let Err(error) = ctx.cancellation.check("applying limit") {
                    return Some(Err(error));
                }
                let rows = block.table.num_rows();
                let start = to_skip.min(rows);
                to_skip -= start;
                let mut end = rows;
                if let Some(rest) = remaining {
                    end = end.min(start + rest);
                }
                if start >= end {
                    continue;
                }
                if let Some(rest) = remaining.as_mut() {
                    *rest -= end - start;
                }
                if start == 0 && end == rows {
                    return Some(Ok(block));
                }
                let mut table = IdTable::new(block.table.num_columns(), ctx.memory.clone());
                for row in start..end {
                    if let Err(error) = table.push_row(&block.table.row_vec(row)) {
                        return Some(Err(error));
                    }
                }
                return Some(Ok(Block {
                    table: Arc::new(table),
                    vocab: Arc::clone(&block.vocab),
                }));
            });
            Ok(QueryResult::Lazy(LazyResult::new(
                sorted_on,
                Box::new(mapped),
            )))
        }
        materialized => {
            let result = materialized.into_materialized(&eval.ctx.memory)?;
            let mut table = result.table.try_clone()?;
            let start = op.offset as usize;
            let end = op
                .limit
                .map_or(table.num_rows(), |l| start.saturating_add(l as usize));
            table.keep_row_range(start, end);
            Ok(QueryResult::materialized(
                table,
                node.sorted_on.clone(),
                (*result.vocab).clone(),
            ))
        }
    }
}

pub(super) fn compute_has_predicate_scan(
    eval: &Evaluator<'_>,
    node: &OpNode,
    op: &HasPredicateScanOp,
) -> EngineResult<QueryResult> {
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    if let Some(subject_col) = op.child_subject_col {
        // Subtree form: extend every child row by the predicates of its
        // subject, skipping the full has-predicate relation.
        let child = eval.materialize(node.children[0], None)?;
        let mut ticker = CancellationTicker::new(
            Arc::clone(&eval.ctx.cancellation),
            "has-predicate scan",
        );
        for row in 0..child.table.num_rows() {
            ticker.tick()?;
            let subject = child.table.at(row, subject_col);
            if let Some(predicates) = eval.ctx.index.predicates_of(subject)? {
                let base = child.table.row_vec(row);
                for &predicate in predicates {
                    let mut values = base.clone();
                    values.push(predicate);
                    out.push_row(&values)?;
                }
            }
        }
        return Ok(QueryResult::materialized(
            out,
            node.sorted_on.clone(),
            (*child.vocab).clone(),
        ));
    }
    match op.subject {
        Some(subject) => {
            if let Some(predicates) = eval.ctx.index.predicates_of(subject)? {
                for &predicate in predicates {
                    out.push_row(&[predicate])?;
                }
            }
        }
        None => {
            let mut ticker = CancellationTicker::new(
                Arc::clone(&eval.ctx.cancellation),
                "has-predicate scan",
            );
            for &(subject, pattern) in eval.ctx.index.subjects_with_patterns()? {
                for &predicate in eval.ctx.index.pattern(pattern)? {
                    ticker.tick()?;
                    out.push_row(&[subject, predicate])?;
                }
            }
        }
    }
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        LocalVocab::new(),
    ))
}

pub(super) fn compute_count_predicates(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &CountPredicatesOp,
) -> EngineResult<QueryResult> {
    let mut counts: FxHashMap<Id, u64> = FxHashMap::default();
    match op.subject_col {
        None => {
            // Count each subject's pattern once: the full-index form.
            for &(_, pattern) in eval.ctx.index.subjects_with_patterns()? {
                for &predicate in eval.ctx.index.pattern(pattern)? {
                    *counts.entry(predicate).or_insert(0) += 1;
                }
            }
        }
        Some(column) => {
            let child = eval.materialize(node.children[0], None)?;
            let mut ticker = CancellationTicker::new(
                Arc::clone(&eval.ctx.cancellation),
                "counting predicates",
            );
            for row in 0..child.table.num_rows() {
                ticker.tick()?;
                let subject = child.table.at(row, column);
                if let Some(predicates) = eval.ctx.index.predicates_of(subject)? {
                    for &predicate in predicates {
                        *counts.entry(predicate).or_insert(0) += 1;
                    }
                }
            }
        }
    }
    let mut entries: Vec<(Id, u64)> = counts.into_iter().collect();
    entries.sort_unstable_by_key(|&(predicate, _)| predicate);
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    for (predicate, count) in entries {
        out.push_row(&[predicate, Id::int(count as i64).unwrap_or(Id::UNDEFINED)])?;
    }
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        LocalVocab::new(),
    ))
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
        builder.add("<s>", "<p>", "<c>").unwrap();
        builder.add("<s>", "<p>", "<c2>").unwrap();
        builder.add("<s>", "<p2>", "<c>").unwrap();
        builder.add("<s2>", "<p2>", "<c2>").unwrap();
        QueryContext::new(Arc::new(builder.build().unwrap()))
    }

    fn full_scan(op_vars: [&str; 3]) -> Operator {
        Operator::IndexScan(IndexScanOp {
            permutation: Permutation::Spo,
            fixed: [None, None, None],
            variables: op_vars.map(|v| Some(Variable::new(v))),
            term_unknown: false,
        })
    }

    #[test]
    fn limit_offset_on_materialized_child() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let scan = arena.push(full_scan(["s", "p", "o"]), &[]).unwrap();
        let limited = arena
            .push(
                Operator::LimitOffset(LimitOffsetOp {
                    limit: Some(2),
                    offset: 1,
                }),
                &[scan],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(limited, None).unwrap();
        assert_eq!(result.table.num_rows(), 2);
        let full = eval.materialize(scan, None).unwrap();
        assert_eq!(result.table.row_vec(0), full.table.row_vec(1));
    }

    #[test]
    fn limit_composition_is_additive() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let scan = arena.push(full_scan(["s", "p", "o"]), &[]).unwrap();
        let once = arena
            .push(
                Operator::LimitOffset(LimitOffsetOp {
                    limit: Some(3),
                    offset: 1,
                }),
                &[scan],
            )
            .unwrap();
        let twice = arena
            .push(
                Operator::LimitOffset(LimitOffsetOp {
                    limit: Some(3),
                    offset: 1,
                }),
                &[once],
            )
            .unwrap();
        let combined = arena
            .push(
                Operator::LimitOffset(LimitOffsetOp {
                    limit: Some(3),
                    offset: 2,
                }),
                &[scan],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let a = eval.materialize(twice, None).unwrap();
        let b = eval.materialize(combined, None).unwrap();
        assert_eq!(a.table.num_rows().min(2), b.table.num_rows().min(2));
        for row in 0..a.table.num_rows().min(b.table.num_rows()) {
            assert_eq!(a.table.row_vec(row), b.table.row_vec(row));
        }
    }

    #[test]
    fn has_predicate_scan_fixed_subject() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let s = ctx.index.get_id(&Term::iri("s")).unwrap();
        let scan = arena
            .push(
                Operator::HasPredicateScan(HasPredicateScanOp {
                    subject: Some(s),
                    subject_var: None,
                    child_subject_col: None,
                    predicate_var: Variable::new("p"),
                }),
                &[],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(scan, None).unwrap();
        // <s> has predicates <p> and <p2>.
        assert_eq!(result.table.num_rows(), 2);
    }

    #[test]
    fn count_predicates_over_full_index() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let count = arena
            .push(
                Operator::CountPredicates(CountPredicatesOp {
                    subject_col: None,
                    predicate_var: Variable::new("p"),
                    count_var: Variable::new("count"),
                }),
                &[],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(count, None).unwrap();
        // <p> is a predicate of one subject, <p2> of two.
        assert_eq!(result.table.num_rows(), 2);
        let p2 = ctx.index.get_id(&Term::iri("p2")).unwrap();
        let row = (0..2).find(|&r| result.table.at(r, 0) == p2).unwrap();
        assert_eq!(result.table.at(row, 1).as_int(), Some(2));
    }
}
