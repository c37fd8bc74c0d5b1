//! Grouping and aggregation.

use std::cmp::Ordering;
use std::sync::Arc;

use ahash::AHashSet;
use rdf_model::{Id, LocalVocab, Term};

use crate::arena::{OpHandle, OpNode};
use crate::cancellation::CancellationTicker;
use crate::error::EngineResult;
use crate::expression::{AggregateOp, EvalContext, Expression};
use crate::idtable::IdTable;
use crate::operator::GroupByOp;
use crate::result::QueryResult;

use super::sort::semantic_cmp;
use super::Evaluator;

pub(super) fn compute(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &GroupByOp,
) -> EngineResult<QueryResult> {
    let child_h = node.children[0];
    let child_node = eval.node(child_h);
    let child = eval.materialize(child_h, None)?;
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    let mut out_vocab = (*child.vocab).clone();
    let mut ticker =
        CancellationTicker::new(Arc::clone(&eval.ctx.cancellation), "computing group by");

    let eval_ctx = EvalContext {
        table: &child.table,
        var_map: &child_node.var_map,
        index: &eval.ctx.index,
        vocab: &child.vocab,
    };

    if child.table.is_empty() {
        if op.group_cols.is_empty() {
            // Aggregates over the empty solution sequence produce one row.
            let mut row = Vec::with_capacity(node.width());
            for aggregate in &op.aggregates {
                row.push(aggregate_over(
                    &aggregate.expression,
                    &eval_ctx,
                    0..0,
                    &mut out_vocab,
                    eval,
                ));
            }
            out.push_row(&row)?;
        }
        return Ok(QueryResult::materialized(
            out,
            node.sorted_on.clone(),
            out_vocab,
        ));
    }

    // The input is sorted on the group columns; one pass over the runs.
    let mut start = 0;
    while start < child.table.num_rows() {
        ticker.tick()?;
        let mut end = start + 1;
        while end < child.table.num_rows()
            && child.table.cmp_rows_on(start, &op.group_cols, &child.table, end, &op.group_cols)
                == Ordering::Equal
        {
            end += 1;
        }
        let mut row = Vec::with_capacity(node.width());
        for &c in &op.group_cols {
            row.push(child.table.at(start, c));
        }
        for aggregate in &op.aggregates {
            row.push(aggregate_over(
                &aggregate.expression,
                &eval_ctx,
                start..end,
                &mut out_vocab,
                eval,
            ));
        }
        out.push_row(&row)?;
        start = end;
    }

    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        out_vocab,
    ))
}

/// Evaluate one aggregate (or plain alias expression) over a group run.
fn aggregate_over(
    expression: &Expression,
    ctx: &EvalContext<'_>,
    rows: std::ops::Range<usize>,
    out_vocab: &mut LocalVocab,
    eval: &Evaluator<'_>,
) -> Id {
    let Expression::Aggregate {
        op,
        distinct,
        expr,
        separator,
    } = expression
    else {
        // A plain alias expression under GROUP BY refers to group columns
        // only, so the first row of the run is representative.
        return match rows.clone().next() {
            Some(row) => expression.evaluate(ctx, row, out_vocab),
            None => Id::UNDEFINED,
        };
    };

    let mut values: Vec<Id> = Vec::new();
    for row in rows.clone() {
        match expr {
            None => values.push(Id::bool(true)),
            Some(inner) => values.push(inner.evaluate(ctx, row, out_vocab)),
        }
    }
    if *distinct {
        let mut seen = AHashSet::new();
        values.retain(|id| seen.insert(*id));
    }

    match op {
        AggregateOp::Count => {
            let count = match expr {
                None => values.len(),
                Some(_) => values.iter().filter(|id| !id.is_undefined()).count(),
            };
            Id::int(count as i64).unwrap_or(Id::UNDEFINED)
        }
        AggregateOp::Sum => {
            let mut sum = 0.0;
            let mut integral = true;
            for value in &values {
                match value.as_numeric() {
                    Some(v) => {
                        integral = integral && value.as_int().is_some();
                        sum += v;
                    }
                    None => return Id::UNDEFINED,
                }
            }
            if integral {
                Id::int(sum as i64).unwrap_or(Id::UNDEFINED)
            } else {
                Id::double(sum)
            }
        }
        AggregateOp::Avg => {
            if values.is_empty() {
                return Id::int(0).unwrap_or(Id::UNDEFINED);
            }
            let mut sum = 0.0;
            for value in &values {
                match value.as_numeric() {
                    Some(v) => sum += v,
                    None => return Id::UNDEFINED,
                }
            }
            Id::double(sum / values.len() as f64)
        }
        AggregateOp::Min | AggregateOp::Max => {
            let mut best: Option<Id> = None;
            for &value in values.iter().filter(|id| !id.is_undefined()) {
                best = Some(match best {
                    None => value,
                    Some(current) => {
                        let ordering =
                            semantic_cmp(&eval.ctx.index, ctx.vocab, value, current);
                        let take = if *op == AggregateOp::Min {
                            ordering == Ordering::Less
                        } else {
                            ordering == Ordering::Greater
                        };
                        if take {
                            value
                        } else {
                            current
                        }
                    }
                });
            }
            best.unwrap_or(Id::UNDEFINED)
        }
        AggregateOp::Sample => values
            .iter()
            .copied()
            .find(|id| !id.is_undefined())
            .unwrap_or(Id::UNDEFINED),
        AggregateOp::GroupConcat => {
            let separator = separator.as_deref().unwrap_or(" ");
            let mut parts: Vec<String> = Vec::new();
            for &value in values.iter().filter(|id| !id.is_undefined()) {
                match ctx.term_of(value) {
                    Some(Term::Literal { lexical, .. }) => parts.push(lexical),
                    Some(Term::Iri(iri)) => parts.push(iri),
                    Some(Term::BlankNode(label)) => parts.push(label),
                    None => return Id::UNDEFINED,
                }
            }
            out_vocab.get_or_add(&Term::literal(parts.join(separator)).to_string())
        }
    }
}
