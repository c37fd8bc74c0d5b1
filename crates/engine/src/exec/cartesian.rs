//! Cartesian product join of disjoint-variable subtrees.

use std::sync::Arc;

use rdf_model::Id;

use crate::arena::{OpHandle, OpNode};
use crate::cancellation::CancellationTicker;
use crate::error::EngineResult;
use crate::idtable::IdTable;
use crate::result::{Block, LazyResult, MaterializedResult, QueryResult, VocabAccumulator};

use super::{Evaluator, CHUNK_SIZE};

fn fill_range(
    sub_results: &[MaterializedResult],
    strides: &[usize],
    remaps: &[Option<Vec<u64>>],
    out: &mut IdTable,
    from: usize,
    to: usize,
    ticker: &mut CancellationTicker,
) -> EngineResult<()> {
    let width = out.num_columns();
    let mut row: Vec<Id> = vec![Id::UNDEFINED; width];
    for k in from..to {
        ticker.tick()?;
        let mut column_offset = 0;
        for (i, result) in sub_results.iter().enumerate() {
            let rows = result.table.num_rows().max(1);
            let source_row = (k / strides[i]) % rows;
            for c in 0..result.table.num_columns() {
                let id = result.table.at(source_row, c);
                row[column_offset + c] = VocabAccumulator::map_id(id, remaps[i].as_deref());
            }
            column_offset += result.table.num_columns();
        }
        out.push_row(&row)?;
    }
    Ok(())
}

pub(super) fn compute(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    request_lazy: bool,
    limit_hint: Option<usize>,
) -> EngineResult<QueryResult> {
    // Children are materialized up front to know the total size. When a
    // LIMIT with zero offset is in effect, children that support native
    // limits get a per-child limit derived from the sizes seen so far.
    let mut sub_results: Vec<MaterializedResult> = Vec::with_capacity(node.children.len());
    let mut per_child_limit = limit_hint;
    for &child in &node.children {
        let hint = per_child_limit.filter(|_| eval.node(child).supports_limit);
        let result = eval.materialize(child, hint)?;
        if let Some(limit) = per_child_limit {
            per_child_limit = Some(limit / result.table.num_rows().max(1) + 1);
        }
        let empty = result.table.is_empty();
        sub_results.push(result);
        if empty {
            // Early stopping: the product is empty.
            break;
        }
    }

    let total: usize = if sub_results.iter().any(|r| r.table.is_empty()) {
        0
    } else {
        sub_results.iter().map(|r| r.table.num_rows()).product()
    };
    let total_with_limit = limit_hint.map_or(total, |limit| limit.min(total));

    let mut acc = VocabAccumulator::new();
    let remaps: Vec<Option<Vec<u64>>> = sub_results
        .iter()
        .map(|result| acc.absorb(&result.vocab))
        .collect();

    // Strides: the first child varies fastest.
    let mut strides = Vec::with_capacity(sub_results.len());
    let mut stride = 1usize;
    for result in &sub_results {
        strides.push(stride);
        stride = stride.saturating_mul(result.table.num_rows().max(1));
    }

    let width = node.width();
    if request_lazy && total_with_limit > CHUNK_SIZE {
        // Stream the product in chunks of at most CHUNK_SIZE rows.
        let ctx = eval.ctx.clone();
        let vocab = acc.vocab().clone();
        let queue_size = eval.ctx.params.lazy_index_scan_queue_size;
        let stream = crate::result::callback_to_stream(queue_size, move |sink| {
            let mut ticker =
                CancellationTicker::new(Arc::clone(&ctx.cancellation), "cartesian product");
            let shared_vocab = Arc::new(vocab);
            let mut from = 0;
            while from < total_with_limit {
                let to = (from + CHUNK_SIZE).min(total_with_limit);
                let mut table = IdTable::new(width, ctx.memory.clone());
                if let Err(error) =
                    fill_range(&sub_results, &strides, &remaps, &mut table, from, to, &mut ticker)
                {
                    sink.fail(error);
                    return;
                }
                let pushed = sink.push(Block {
                    table: Arc::new(table),
                    vocab: Arc::clone(&shared_vocab),
                });
                if !pushed {
                    return;
                }
                from = to;
            }
        });
        return Ok(QueryResult::Lazy(LazyResult::new(Vec::new(), stream)));
    }

    let mut out = IdTable::new(width, eval.ctx.memory.clone());
    let mut ticker =
        CancellationTicker::new(Arc::clone(&eval.ctx.cancellation), "cartesian product");
    fill_range(
        &sub_results,
        &strides,
        &remaps,
        &mut out,
        0,
        total_with_limit,
        &mut ticker,
    )?;
    Ok(QueryResult::materialized(out, Vec::new(), acc.into_vocab()))
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
        builder.add("<s2>", "<p2>", "<c2>").unwrap();
        QueryContext::new(Arc::new(builder.build().unwrap()))
    }

    fn scan(ctx: &QueryContext, predicate: &str, s: &str, o: &str) -> Operator {
        let p = ctx.index.get_id(&Term::iri(predicate));
        Operator::IndexScan(IndexScanOp {
            permutation: Permutation::Pso,
            fixed: [None, p, None],
            variables: [Some(Variable::new(s)), None, Some(Variable::new(o))],
            term_unknown: p.is_none(),
        })
    }

    #[test]
    fn product_of_two_scans() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let a = arena.push(scan(&ctx, "p", "a", "b"), &[]).unwrap();
        let b = arena.push(scan(&ctx, "p2", "c", "d"), &[]).unwrap();
        let product = arena.push(Operator::CartesianProduct, &[a, b]).unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(product, None).unwrap();
        // 2 rows x 1 row.
        assert_eq!(result.table.num_rows(), 2);
        assert_eq!(result.table.num_columns(), 4);
        // The first child varies fastest: its two rows appear in order.
        assert!(result.table.at(0, 0) <= result.table.at(1, 0) || result.table.at(0, 1) != result.table.at(1, 1));
    }

    #[test]
    fn limit_truncates_product() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let a = arena.push(scan(&ctx, "p", "a", "b"), &[]).unwrap();
        let b = arena.push(scan(&ctx, "p2", "c", "d"), &[]).unwrap();
        let product = arena.push(Operator::CartesianProduct, &[a, b]).unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(product, Some(1)).unwrap();
        assert_eq!(result.table.num_rows(), 1);
    }
}
