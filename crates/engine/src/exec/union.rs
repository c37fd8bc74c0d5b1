//! Union (column-harmonizing concatenation), VALUES materialization.

use std::sync::Arc;

use rdf_model::{Id, LocalVocab, MergeSide};

use crate::arena::{OpHandle, OpNode};
use crate::error::EngineResult;
use crate::idtable::IdTable;
use crate::operator::{UnionOp, ValuesOp};
use crate::result::{Block, LazyResult, QueryResult};

use super::Evaluator;

pub(super) fn compute_union(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &UnionOp,
    request_lazy: bool,
) -> EngineResult<QueryResult> {
    let left_h = node.children[0];
    let right_h = node.children[1];

    if request_lazy {
        // Stream left blocks, then right blocks, each remapped to the
        // union's column layout. No global sort order is declared, so plain
        // concatenation is a valid lazy result.
        let origins = op.column_origins.clone();
        let width = node.width();
        let ctx = eval.ctx.clone();
        let left = eval.evaluate(left_h, true, None)?.into_blocks()?;
        let right = eval.evaluate(right_h, true, None)?.into_blocks()?;
        let map_side = move |side: usize| {
            let origins = origins.clone();
            let ctx = ctx.clone();
            move |block: crate::error::EngineResult<Block>| -> crate::error::EngineResult<Block> {
                let block = block?;
                ctx.cancellation.check("computing union")?;
                let mut out = IdTable::new(width, ctx.memory.clone());
                for row in 0..block.table.num_rows() {
                    let values: Vec<Id> = origins
                        .iter()
                        .map(|origin| match origin[side] {
                            Some(column) => block.table.at(row, column),
                            None => Id::UNDEFINED,
                        })
                        .collect();
                    out.push_row(&values)?;
                }
                Ok(Block {
                    table: Arc::new(out),
                    vocab: Arc::clone(&block.vocab),
                })
            }
        };
        let stream = left.map(map_side(0)).chain(right.map(map_side(1)));
        return Ok(QueryResult::Lazy(LazyResult::new(
            Vec::new(),
            Box::new(stream),
        )));
    }

    let left = eval.materialize(left_h, None)?;
    let right = eval.materialize(right_h, None)?;
    let merger = rdf_model::LocalVocabMerger::merge(&left.vocab, &right.vocab);
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    for (side, result) in [(MergeSide::Left, &left), (MergeSide::Right, &right)] {
        let side_index = if side == MergeSide::Left { 0 } else { 1 };
        eval.ctx.cancellation.check("computing union")?;
        for row in 0..result.table.num_rows() {
            let values: Vec<Id> = op
                .column_origins
                .iter()
                .map(|origin| match origin[side_index] {
                    Some(column) => merger.map_id(side, result.table.at(row, column)),
                    None => Id::UNDEFINED,
                })
                .collect();
            out.push_row(&values)?;
        }
    }
    Ok(QueryResult::materialized(
        out,
        Vec::new(),
        merger.into_vocab(),
    ))
}

pub(super) fn compute_values(
    eval: &Evaluator<'_>,
    node: &OpNode,
    op: &ValuesOp,
) -> EngineResult<QueryResult> {
    let mut vocab = LocalVocab::new();
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    for row in &op.rows {
        let values: Vec<Id> = row
            .iter()
            .map(|term| match term {
                None => Id::UNDEFINED,
                Some(term) => term
                    .value_id()
                    .or_else(|| eval.ctx.index.get_id(term))
                    .unwrap_or_else(|| vocab.get_or_add(&term.to_string())),
            })
            .collect();
        out.push_row(&values)?;
    }
    Ok(QueryResult::materialized(out, Vec::new(), vocab))
}
