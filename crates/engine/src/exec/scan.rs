//! Index scan execution.

use std::sync::Arc;

use rdf_model::LocalVocab;

use crate::arena::OpNode;
use crate::error::EngineResult;
use crate::idtable::IdTable;
use crate::operator::IndexScanOp;
use crate::result::{Block, LazyResult, QueryResult};
use index::ScanSpec;

use super::Evaluator;

/// Derive the concrete [`ScanSpec`] (and, for fully bound triples, the
/// remaining equality check) from a scan operator. Also used by the
/// index-nested-loop join to probe with an additional bound column.
pub(super) fn probe_spec(op: &IndexScanOp) -> (ScanSpec, Option<rdf_model::Id>) {
    spec_for(op, None)
}

fn spec_for(op: &IndexScanOp, limit_hint: Option<usize>) -> (ScanSpec, Option<rdf_model::Id>) {
    let order = op.permutation.key_order();
    let fixed_in_key_order: Vec<Option<rdf_model::Id>> =
        order.iter().map(|&pos| op.fixed[pos]).collect();
    let mut spec = ScanSpec {
        permutation: op.permutation,
        col0: fixed_in_key_order[0],
        col1: fixed_in_key_order[0].and(fixed_in_key_order[1]),
        limit: limit_hint,
    };
    // A fully bound triple runs as a two-column scan plus an equality check
    // on the remaining position.
    let existence_check = if spec.col1.is_some() {
        fixed_in_key_order[2]
    } else {
        None
    };
    if existence_check.is_some() {
        spec.limit = None;
    }
    (spec, existence_check)
}

pub(super) fn compute(
    eval: &Evaluator<'_>,
    node: &OpNode,
    op: &IndexScanOp,
    request_lazy: bool,
    limit_hint: Option<usize>,
) -> EngineResult<QueryResult> {
    let (spec, existence_check) = spec_for(op, limit_hint);
    let sorted_on = node.sorted_on.clone();

    if let Some(col2) = existence_check {
        // ASK-style triple with all three positions fixed.
        let blocks = eval.ctx.index.scan(&spec)?;
        let mut exists = false;
        for block in blocks {
            eval.ctx.cancellation.check("index scan")?;
            if block.columns[0].binary_search(&col2).is_ok() {
                exists = true;
                break;
            }
        }
        let mut table = IdTable::new(0, eval.ctx.memory.clone());
        if exists {
            table.push_row(&[])?;
        }
        return Ok(QueryResult::materialized(
            table,
            sorted_on,
            LocalVocab::new(),
        ));
    }

    if request_lazy {
        // Stream the scan block by block through a worker so that downstream
        // consumers overlap with index access.
        let index = Arc::clone(&eval.ctx.index);
        let memory = eval.ctx.memory.clone();
        let cancellation = Arc::clone(&eval.ctx.cancellation);
        let queue_size = eval.ctx.params.lazy_index_scan_queue_size;
        let stream = crate::result::callback_to_stream(queue_size, move |sink| {
            let blocks = match index.scan(&spec) {
                Ok(blocks) => blocks,
                Err(error) => {
                    sink.fail(error.into());
                    return;
                }
            };
            let empty_vocab = Arc::new(LocalVocab::new());
            for block in blocks {
                if cancellation.check("lazy index scan").is_err() {
                    return;
                }
                let table = match IdTable::from_columns(block.columns, memory.clone()) {
                    Ok(table) => table,
                    Err(error) => {
                        sink.fail(error);
                        return;
                    }
                };
                let pushed = sink.push(Block {
                    table: Arc::new(table),
                    vocab: Arc::clone(&empty_vocab),
                });
                if !pushed {
                    return;
                }
            }
        });
        return Ok(QueryResult::Lazy(LazyResult::new(sorted_on, stream)));
    }

    let blocks = eval.ctx.index.scan(&spec)?;
    let mut table = IdTable::new(node.width(), eval.ctx.memory.clone());
    for block in blocks {
        eval.ctx.cancellation.check("index scan")?;
        for row in 0..block.num_rows() {
            let values: Vec<rdf_model::Id> =
                (0..block.num_columns()).map(|c| block.columns[c][row]).collect();
            table.push_row(&values)?;
        }
    }
    Ok(QueryResult::materialized(
        table,
        sorted_on,
        LocalVocab::new(),
    ))
}
