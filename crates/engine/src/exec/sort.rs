//! Sort (internal id order), OrderBy (semantic order) and Distinct.
//!
//! `Sort` and `OrderBy` are deliberately distinct operators: the internal
//! id order is what joins and distinct need and is cheap; the semantic
//! SPARQL order (IRIs, then blanks, then literals grouped by kind) requires
//! vocabulary lookups and is only used for the user-visible ORDER BY.

use std::cmp::Ordering;
use std::sync::Arc;

use rdf_model::{Id, LocalVocab, Tag, Term};

use crate::arena::{OpHandle, OpNode};
use crate::error::EngineResult;
use crate::idtable::IdTable;
use crate::merge::parallel_multiway_merge;
use crate::operator::{DistinctOp, OrderByOp, SortOp};
use crate::result::{Block, LazyResult, QueryResult, VocabAccumulator};

use super::{Evaluator, CHUNK_SIZE};

pub(super) fn compute_sort(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &SortOp,
) -> EngineResult<QueryResult> {
    let child_h = node.children[0];
    let child = eval.evaluate(child_h, true, None)?;

    match child {
        QueryResult::Lazy(mut lazy) => {
            // Sort each incoming block, then merge the sorted runs with the
            // parallel multiway merge.
            let stream = lazy.take_stream()?;
            let sort_cols = op.sort_cols.clone();
            let mut acc = VocabAccumulator::new();
            let mut runs: Vec<crate::merge::BlockIter<Vec<Id>>> = Vec::new();
            for block in stream {
                let block = block?;
                eval.ctx.cancellation.check("sorting")?;
                let remap = acc.absorb(&block.vocab);
                let mut rows: Vec<Vec<Id>> = (0..block.table.num_rows())
                    .map(|row| {
                        (0..block.table.num_columns())
                            .map(|c| {
                                VocabAccumulator::map_id(
                                    block.table.at(row, c),
                                    remap.as_deref(),
                                )
                            })
                            .collect()
                    })
                    .collect();
                let cols = sort_cols.clone();
                rows.sort_unstable_by(|a, b| cmp_rows(a, b, &cols));
                runs.push(Box::new(std::iter::once(rows)));
            }
            let cols = sort_cols.clone();
            let merged = parallel_multiway_merge(4 * CHUNK_SIZE, runs, move |a, b| {
                cmp_rows(a, b, &cols) == Ordering::Less
            });
            let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
            for run in merged {
                eval.ctx.cancellation.check("sorting")?;
                for row in run {
                    out.push_row(&row)?;
                }
            }
            Ok(QueryResult::materialized(
                out,
                node.sorted_on.clone(),
                acc.into_vocab(),
            ))
        }
        materialized => {
            let result = materialized.into_materialized(&eval.ctx.memory)?;
            let mut table = result.table.try_clone()?;
            eval.ctx.cancellation.check("sorting")?;
            table.sort_by_columns(&op.sort_cols);
            Ok(QueryResult::materialized(
                table,
                node.sorted_on.clone(),
                (*result.vocab).clone(),
            ))
        }
    }
}

fn cmp_rows(a: &[Id], b: &[Id], cols: &[usize]) -> Ordering {
    for &c in cols {
        match a[c].cmp(&b[c]) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

// ---------------------------------------------------------------------------
// OrderBy: semantic order
// ---------------------------------------------------------------------------

/// Class rank of the semantic order: unbound, then IRIs, then blank nodes,
/// then literals (numeric, date, string, everything else).
fn semantic_class(index: &index::Index, vocab: &LocalVocab, id: Id) -> u8 {
    match id.tag() {
        Tag::Undefined => 0,
        Tag::BlankNodeIndex => 2,
        Tag::Int | Tag::Double => 3,
        Tag::Date => 4,
        Tag::Bool | Tag::GeoPoint | Tag::TextRecordIndex => 6,
        Tag::VocabIndex | Tag::LocalVocabIndex => {
            let term = if id.tag() == Tag::VocabIndex {
                index.id_to_term(id)
            } else {
                vocab.word_for_id(id).and_then(|w| Term::parse(w).ok())
            };
            match term {
                Some(Term::Iri(_)) => 1,
                Some(Term::BlankNode(_)) => 2,
                Some(Term::Literal { datatype: None, .. }) => 5,
                Some(Term::Literal { .. }) => 6,
                None => 6,
            }
        }
    }
}

fn resolve_string(index: &index::Index, vocab: &LocalVocab, id: Id) -> Option<String> {
    let term = match id.tag() {
        Tag::LocalVocabIndex => vocab.word_for_id(id).and_then(|w| Term::parse(w).ok()),
        _ => index.id_to_term(id),
    }?;
    Some(match term {
        Term::Iri(iri) => iri,
        Term::Literal { lexical, .. } => lexical,
        Term::BlankNode(label) => label,
    })
}

/// Semantic comparison of two ids; strings compare by Unicode code point.
pub(crate) fn semantic_cmp(
    index: &index::Index,
    vocab: &LocalVocab,
    a: Id,
    b: Id,
) -> Ordering {
    let class_a = semantic_class(index, vocab, a);
    let class_b = semantic_class(index, vocab, b);
    if class_a != class_b {
        return class_a.cmp(&class_b);
    }
    match class_a {
        3 => a
            .as_numeric()
            .partial_cmp(&b.as_numeric())
            .unwrap_or(Ordering::Equal),
        1 | 2 | 5 | 6 => {
            match (
                resolve_string(index, vocab, a),
                resolve_string(index, vocab, b),
            ) {
                (Some(sa), Some(sb)) => sa.cmp(&sb).then_with(|| a.cmp(&b)),
                _ => a.cmp(&b),
            }
        }
        _ => a.cmp(&b),
    }
}

pub(super) fn compute_order_by(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &OrderByOp,
) -> EngineResult<QueryResult> {
    let child_h = node.children[0];
    let result = eval.materialize(child_h, None)?;
    let mut table = result.table.try_clone()?;
    eval.ctx.cancellation.check("ordering result")?;

    let index = &eval.ctx.index;
    let vocab = &result.vocab;
    let keys = op.keys.clone();
    let mut permutation: Vec<usize> = (0..table.num_rows()).collect();
    permutation.sort_by(|&x, &y| {
        for &(column, descending) in &keys {
            let ordering = semantic_cmp(index, vocab, table.at(x, column), table.at(y, column));
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    table.apply_row_permutation(&permutation);
    Ok(QueryResult::materialized(
        table,
        // Semantic order is not the internal id order.
        Vec::new(),
        (*result.vocab).clone(),
    ))
}

// ---------------------------------------------------------------------------
// Distinct
// ---------------------------------------------------------------------------

pub(super) fn compute_distinct(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &DistinctOp,
    request_lazy: bool,
) -> EngineResult<QueryResult> {
    let child_h = node.children[0];
    let child_node = eval.node(child_h);

    if request_lazy && child_node.supports_lazy {
        if let QueryResult::Lazy(mut lazy) = eval.evaluate(child_h, true, None)? {
            let stream = lazy.take_stream()?;
            let keep_cols = op.keep_cols.clone();
            let ctx = eval.ctx.clone();
            let sorted_on = node.sorted_on.clone();
            // The previously emitted key survives across block boundaries.
            let mut last_key: Option<Vec<Id>> = None;
            let mapped = stream.map(move |block| {
                let block = block?;
                ctx.cancellation.check("computing distinct")?;
                let mut out = IdTable::new(block.table.num_columns(), ctx.memory.clone());
                for row in 0..block.table.num_rows() {
                    let key: Vec<Id> =
                        keep_cols.iter().map(|&c| block.table.at(row, c)).collect();
                    if last_key.as_ref() != Some(&key) {
                        out.push_row(&block.table.row_vec(row))?;
                        last_key = Some(key);
                    }
                }
                Ok(Block {
                    table: Arc::new(out),
                    vocab: Arc::clone(&block.vocab),
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
    let mut last: Option<usize> = None;
    for row in 0..child.table.num_rows() {
        let is_new = match last {
            None => true,
            Some(previous) => child.table.cmp_rows_on(
                previous,
                &op.keep_cols,
                &child.table,
                row,
                &op.keep_cols,
            ) != Ordering::Equal,
        };
        if is_new {
            out.push_row(&child.table.row_vec(row))?;
            last = Some(row);
        }
    }
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        (*child.vocab).clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLimit;

    fn id(v: i64) -> Id {
        Id::int(v).unwrap()
    }

    #[test]
    fn semantic_order_classes() {
        let index = index::IndexBuilder::default().build().unwrap();
        let vocab = LocalVocab::new();
        // Numbers order by value regardless of tag.
        assert_eq!(
            semantic_cmp(&index, &vocab, id(2), Id::double(2.5)),
            Ordering::Less
        );
        // Undefined sorts first.
        assert_eq!(
            semantic_cmp(&index, &vocab, Id::UNDEFINED, id(-100)),
            Ordering::Less
        );
    }

    #[test]
    fn distinct_dedups_sorted_runs() {
        let mut table = IdTable::new(1, MemoryLimit::unlimited());
        for v in [1, 1, 2, 2, 2, 3] {
            table.push_row(&[id(v)]).unwrap();
        }
        // Exercised through the materialized path in the evaluator tests;
        // here only the run comparison helper.
        assert_eq!(cmp_rows(&[id(1)], &[id(1)], &[0]), Ordering::Equal);
        assert_eq!(cmp_rows(&[id(1)], &[id(2)], &[0]), Ordering::Less);
    }
}
