//! Filter and bind execution.

use std::ops::Range;
use std::sync::Arc;

use rdf_model::{Id, Term};

use crate::arena::{OpHandle, OpNode};
use crate::cancellation::CancellationTicker;
use crate::error::EngineResult;
use crate::expression::{EvalContext, Expression, RelOp};
use crate::idtable::IdTable;
use crate::operator::{BindOp, FilterOp};
use crate::result::{Block, LazyResult, QueryResult};

use super::Evaluator;

pub(super) fn compute_filter(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &FilterOp,
    request_lazy: bool,
) -> EngineResult<QueryResult> {
    let child_h = node.children[0];
    let child_node = eval.node(child_h);

    if request_lazy && child_node.supports_lazy {
        let child = eval.evaluate(child_h, true, None)?;
        if let QueryResult::Lazy(mut lazy) = child {
            let stream = lazy.take_stream()?;
            let expression = op.expression.clone();
            let ctx = eval.ctx.clone();
            let var_map = child_node.var_map.clone();
            let sorted_on = node.sorted_on.clone();
            let mapped = stream.map(move |block| {
                let block = block?;
                ctx.cancellation.check("computing filter")?;
                let mut out_vocab = (*block.vocab).clone();
                let mut out = IdTable::new(block.table.num_columns(), ctx.memory.clone());
                {
                    let eval_ctx = EvalContext {
                        table: &block.table,
                        var_map: &var_map,
                        index: &ctx.index,
                        vocab: &block.vocab,
                    };
                    for row in 0..block.table.num_rows() {
                        if expression
                            .evaluate_bool(&eval_ctx, row, &mut out_vocab)
                            .is_true()
                        {
                            out.push_row(&block.table.row_vec(row))?;
                        }
                    }
                }
                Ok(Block {
                    table: Arc::new(out),
                    vocab: Arc::new(out_vocab),
                })
            });
            return Ok(QueryResult::Lazy(LazyResult::new(
                sorted_on,
                Box::new(mapped),
            )));
        }
        // The child ignored the laziness request; fall through.
    }

    let child = eval.materialize(child_h, None)?;
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    let mut out_vocab = (*child.vocab).clone();

    // Relational constraints on the leading sort column reduce to copying
    // binary-searched row ranges.
    if let Some(ranges) = sorted_prefix_ranges(eval, child_node, &child.table, &op.expression) {
        for range in ranges {
            for row in range {
                out.push_row(&child.table.row_vec(row))?;
            }
        }
        return Ok(QueryResult::materialized(
            out,
            node.sorted_on.clone(),
            out_vocab,
        ));
    }

    let mut ticker = CancellationTicker::new(
        Arc::clone(&eval.ctx.cancellation),
        "computing filter",
    );
    {
        let eval_ctx = EvalContext {
            table: &child.table,
            var_map: &child_node.var_map,
            index: &eval.ctx.index,
            vocab: &child.vocab,
        };
        for row in 0..child.table.num_rows() {
            ticker.tick()?;
            if op
                .expression
                .evaluate_bool(&eval_ctx, row, &mut out_vocab)
                .is_true()
            {
                out.push_row(&child.table.row_vec(row))?;
            }
        }
    }
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        out_vocab,
    ))
}

/// The binary-search fast path: `?x <op> constant` where `?x` is the leading
/// sort column of the child and the constant is a vocabulary term. Returns
/// the row ranges that satisfy the filter, or `None` when the general
/// evaluation must run.
fn sorted_prefix_ranges(
    eval: &Evaluator<'_>,
    child_node: &OpNode,
    table: &IdTable,
    expression: &Expression,
) -> Option<Vec<Range<usize>>> {
    let (variable, op, constant) = expression.as_prefix_range_filter()?;
    let column = child_node.var_map.column_of(variable)?;
    if child_node.sorted_on.first() != Some(&column) {
        return None;
    }
    let Expression::Constant(term) = constant else {
        // Inlined numeric constants cross-compare with other numeric tags;
        // the general evaluation handles that correctly.
        return None;
    };
    if term.value_id().is_some() || matches!(term, Term::BlankNode(_)) {
        return None;
    }
    let vocab = eval.ctx.index.vocabulary();
    let word = term.to_string();
    let exact = vocab.get_id(&word);
    let boundary = Id::vocab_index(vocab.insertion_point(&word));
    // Comparisons against a string constant are only defined for vocabulary
    // entries; every other tag is incomparable and never passes the filter.
    let tag_lo = Id::vocab_index(0);
    let tag_hi = Id::vocab_index(vocab.len() as u64);

    let col = table.column(column);
    let lower = |bound: Id| col.partition_point(|&id| id < bound);
    let tag_range = lower(tag_lo)..lower(tag_hi);

    let ranges = match (op, exact) {
        (RelOp::Eq, None) => vec![],
        (RelOp::Eq, Some(id)) => {
            let start = col.partition_point(|&v| v < id);
            let end = col.partition_point(|&v| v <= id);
            vec![start..end]
        }
        (RelOp::Ne, None) => vec![tag_range],
        (RelOp::Ne, Some(id)) => {
            let start = col.partition_point(|&v| v < id);
            let end = col.partition_point(|&v| v <= id);
            vec![tag_range.start..start, end..tag_range.end]
        }
        (RelOp::Lt, _) => vec![tag_range.start..lower(boundary)],
        (RelOp::Le, _) => {
            let end = match exact {
                Some(id) => col.partition_point(|&v| v <= id),
                None => lower(boundary),
            };
            vec![tag_range.start..end]
        }
        (RelOp::Gt, _) => {
            let start = match exact {
                Some(id) => col.partition_point(|&v| v <= id),
                None => lower(boundary),
            };
            vec![start..tag_range.end]
        }
        (RelOp::Ge, _) => vec![lower(boundary)..tag_range.end],
    };
    Some(
        ranges
            .into_iter()
            .filter(|range| range.start < range.end)
            .collect(),
    )
}

pub(super) fn compute_bind(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &BindOp,
    request_lazy: bool,
) -> EngineResult<QueryResult> {
    let child_h = node.children[0];
    let child_node = eval.node(child_h);

    if request_lazy && child_node.supports_lazy {
        if let QueryResult::Lazy(mut lazy) = eval.evaluate(child_h, true, None)? {
            let stream = lazy.take_stream()?;
            let expression = op.expression.clone();
            let ctx = eval.ctx.clone();
            let var_map = child_node.var_map.clone();
            let sorted_on = node.sorted_on.clone();
            let mapped = stream.map(move |block| {
                let block = block?;
                ctx.cancellation.check("computing bind")?;
                let mut out_vocab = (*block.vocab).clone();
                let mut out = IdTable::new(block.table.num_columns() + 1, ctx.memory.clone());
                {
                    let eval_ctx = EvalContext {
                        table: &block.table,
                        var_map: &var_map,
                        index: &ctx.index,
                        vocab: &block.vocab,
                    };
                    for row in 0..block.table.num_rows() {
                        let mut values = block.table.row_vec(row);
                        values.push(expression.evaluate(&eval_ctx, row, &mut out_vocab));
                        out.push_row(&values)?;
                    }
                }
                Ok(Block {
                    table: Arc::new(out),
                    vocab: Arc::new(out_vocab),
                })
            });
            return Ok(QueryResult::Lazy(LazyResult::new(
                sorted_on,
                Box::new(mapped),
            )));
        }
    }

    let child = eval.materialize(child_h, None)?;
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    let mut out_vocab = (*child.vocab).clone();
    let mut ticker =
        CancellationTicker::new(Arc::clone(&eval.ctx.cancellation), "computing bind");
    {
        let eval_ctx = EvalContext {
            table: &child.table,
            var_map: &child_node.var_map,
            index: &eval.ctx.index,
            vocab: &child.vocab,
        };
        for row in 0..child.table.num_rows() {
            ticker.tick()?;
            let mut values = child.table.row_vec(row);
            values.push(op.expression.evaluate(&eval_ctx, row, &mut out_vocab));
            out.push_row(&values)?;
        }
    }
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        out_vocab,
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

    fn context() -> QueryContext {
        let mut builder = IndexBuilder::new(IndexConfig::default());
        builder.add("<a>", "<p>", "<o1>").unwrap();
        builder.add("<b>", "<p>", "<o2>").unwrap();
        builder.add("<c>", "<p>", "<o3>").unwrap();
        QueryContext::new(Arc::new(builder.build().unwrap()))
    }

    fn scan(ctx: &QueryContext) -> Operator {
        let p = ctx.index.get_id(&Term::iri("p"));
        Operator::IndexScan(IndexScanOp {
            permutation: Permutation::Pso,
            fixed: [None, p, None],
            variables: [Some(Variable::new("x")), None, Some(Variable::new("y"))],
            term_unknown: p.is_none(),
        })
    }

    fn filtered(ctx: &QueryContext, expression: Expression) -> (PlanArena, OpHandle) {
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let child = arena.push(scan(ctx), &[]).unwrap();
        let filter = arena
            .push(Operator::Filter(FilterOp { expression }), &[child])
            .unwrap();
        (arena, filter)
    }

    #[test]
    fn equality_filter_on_sorted_prefix() {
        let ctx = context();
        let expr = Expression::eq(
            Expression::var("x"),
            Expression::Constant(Term::iri("b")),
        );
        let (arena, handle) = filtered(&ctx, expr);
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(handle, None).unwrap();
        assert_eq!(result.table.num_rows(), 1);
        let b = ctx.index.get_id(&Term::iri("b")).unwrap();
        assert_eq!(result.table.at(0, 0), b);
    }

    #[test]
    fn range_filter_on_sorted_prefix() {
        let ctx = context();
        let expr = Expression::relational(
            RelOp::Ge,
            Expression::var("x"),
            Expression::Constant(Term::iri("b")),
        );
        let (arena, handle) = filtered(&ctx, expr);
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(handle, None).unwrap();
        assert_eq!(result.table.num_rows(), 2);
    }

    #[test]
    fn filter_on_missing_constant() {
        let ctx = context();
        let expr = Expression::eq(
            Expression::var("x"),
            Expression::Constant(Term::iri("zzz")),
        );
        let (arena, handle) = filtered(&ctx, expr);
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(handle, None).unwrap();
        assert_eq!(result.table.num_rows(), 0);
    }

    #[test]
    fn bind_appends_column() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let child = arena.push(scan(&ctx), &[]).unwrap();
        let bind = arena
            .push(
                Operator::Bind(BindOp {
                    expression: Expression::Int(7),
                    variable: Variable::new("n"),
                }),
                &[child],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(bind, None).unwrap();
        assert_eq!(result.table.num_columns(), 3);
        assert_eq!(result.table.at(0, 2).as_int(), Some(7));
    }
}
