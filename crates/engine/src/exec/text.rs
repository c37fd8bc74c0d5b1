//! Text-index operators: word scan, entity scan and TextLimit.

use std::cmp::Ordering;
use std::sync::Arc;

use rdf_model::{Id, LocalVocab, Term};

use crate::arena::{OpHandle, OpNode};
use crate::cancellation::CancellationTicker;
use crate::error::EngineResult;
use crate::idtable::IdTable;
use crate::operator::{Endpoint, EntityScanOp, TextLimitOp, WordScanOp};
use crate::result::QueryResult;

use super::Evaluator;

pub(super) fn compute_word_scan(
    eval: &Evaluator<'_>,
    node: &OpNode,
    op: &WordScanOp,
) -> EngineResult<QueryResult> {
    let text = eval.ctx.index.text_index()?;
    let mut vocab = LocalVocab::new();
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    for posting in text.word_scan(&op.word) {
        let record = Id::text_record_index(posting.record);
        if op.match_var.is_some() {
            let word = vocab.get_or_add(&Term::literal(posting.word).to_string());
            out.push_row(&[record, word])?;
        } else {
            out.push_row(&[record])?;
        }
    }
    // Postings arrive sorted by (record, word); the local-vocab ids of the
    // matched words are not ordered, so re-establish the declared order.
    out.sort_by_columns(&node.sorted_on);
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        vocab,
    ))
}

pub(super) fn compute_entity_scan(
    eval: &Evaluator<'_>,
    node: &OpNode,
    op: &EntityScanOp,
) -> EngineResult<QueryResult> {
    let text = eval.ctx.index.text_index()?;
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    match &op.entity {
        Endpoint::Var(_) => {
            for &(record, entity, score) in text.entity_postings() {
                out.push_row(&[
                    Id::text_record_index(record),
                    entity,
                    Id::int(score as i64).unwrap_or(Id::UNDEFINED),
                ])?;
            }
        }
        Endpoint::Fixed(entity) => {
            for (record, score) in text.entity_scan(*entity) {
                out.push_row(&[
                    Id::text_record_index(record),
                    Id::int(score as i64).unwrap_or(Id::UNDEFINED),
                ])?;
            }
        }
    }
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        LocalVocab::new(),
    ))
}

pub(super) fn compute_text_limit(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &TextLimitOp,
) -> EngineResult<QueryResult> {
    let child = eval.materialize(node.children[0], None)?;
    if op.limit == 0 {
        let out = IdTable::new(node.width(), eval.ctx.memory.clone());
        return Ok(QueryResult::materialized(
            out,
            node.sorted_on.clone(),
            (*child.vocab).clone(),
        ));
    }

    let mut table = child.table.try_clone()?;
    let mut ticker = CancellationTicker::new(
        Arc::clone(&eval.ctx.cancellation),
        "computing text limit",
    );

    let score_sum = |t: &IdTable, row: usize| -> i64 {
        op.score_cols
            .iter()
            .map(|&c| t.at(row, c).as_int().unwrap_or(0))
            .sum()
    };
    let cmp_entities = |t: &IdTable, a: usize, b: usize| -> Ordering {
        t.cmp_rows_on(a, &op.entity_cols, t, b, &op.entity_cols)
    };

    // Order: entities ascending, summed score descending, text record
    // descending.
    let mut permutation: Vec<usize> = (0..table.num_rows()).collect();
    permutation.sort_by(|&a, &b| {
        cmp_entities(&table, a, b)
            .then_with(|| score_sum(&table, b).cmp(&score_sum(&table, a)))
            .then_with(|| {
                table
                    .at(b, op.record_col)
                    .cmp(&table.at(a, op.record_col))
            })
    });
    table.apply_row_permutation(&permutation);

    // Keep the first `limit` distinct text records per entity tuple.
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    let mut entity_anchor = 0usize;
    let mut records_kept = 0u64;
    let mut last_record_added = false;
    for row in 0..table.num_rows() {
        ticker.tick()?;
        if row == 0 {
            out.push_row(&table.row_vec(row))?;
            records_kept = 1;
            last_record_added = true;
            continue;
        }
        if cmp_entities(&table, row, entity_anchor) != Ordering::Equal {
            entity_anchor = row;
            records_kept = 1;
        } else if table.at(row, op.record_col) != table.at(row - 1, op.record_col) {
            if records_kept >= op.limit {
                last_record_added = false;
                continue;
            }
            records_kept += 1;
        } else if !last_record_added {
            continue;
        }
        out.push_row(&table.row_vec(row))?;
        last_record_added = true;
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
    use crate::arena::PlanArena;
    use crate::context::QueryContext;
    use crate::operator::Operator;
    use crate::variable::Variable;
    use index::{IndexBuilder, IndexConfig};

    fn context() -> QueryContext {
        let mut builder = IndexBuilder::new(IndexConfig::default());
        builder.add("<x>", "<p>", "<y>").unwrap();
        builder.add_text_record(
            "alpha beta gamma",
            vec![Term::parse("<x>").unwrap()],
        );
        builder.add_text_record("beta delta", vec![Term::parse("<y>").unwrap()]);
        QueryContext::new(Arc::new(builder.build().unwrap()))
    }

    #[test]
    fn word_scan_exact() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let scan = arena
            .push(
                Operator::WordScan(WordScanOp {
                    word: "beta".into(),
                    record_var: Variable::new("t"),
                    match_var: None,
                }),
                &[],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(scan, None).unwrap();
        assert_eq!(result.table.num_rows(), 2);
        assert!(result.table.is_sorted_by(&[0]));
    }

    #[test]
    fn prefix_scan_reports_matched_word() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let scan = arena
            .push(
                Operator::WordScan(WordScanOp {
                    word: "de*".into(),
                    record_var: Variable::new("t"),
                    match_var: Some(Variable::new("word")),
                }),
                &[],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(scan, None).unwrap();
        assert_eq!(result.table.num_rows(), 1);
        assert_eq!(
            result.vocab.word_for_id(result.table.at(0, 1)),
            Some("\"delta\"")
        );
    }

    #[test]
    fn entity_scan_lists_postings() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let scan = arena
            .push(
                Operator::EntityScan(EntityScanOp {
                    record_var: Variable::new("t"),
                    entity: Endpoint::Var(Variable::new("e")),
                    score_var: Variable::new("score"),
                }),
                &[],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(scan, None).unwrap();
        assert_eq!(result.table.num_rows(), 2);
        assert!(result.table.is_sorted_by(&[0, 1]));
    }

    #[test]
    fn text_limit_keeps_top_records_per_entity() {
        let ctx = context();
        let mut arena = PlanArena::new(Arc::clone(&ctx.index));
        let scan = arena
            .push(
                Operator::EntityScan(EntityScanOp {
                    record_var: Variable::new("t"),
                    entity: Endpoint::Var(Variable::new("e")),
                    score_var: Variable::new("score"),
                }),
                &[],
            )
            .unwrap();
        let limit = arena
            .push(
                Operator::TextLimit(TextLimitOp {
                    limit: 1,
                    record_col: 0,
                    entity_cols: vec![1],
                    score_cols: vec![2],
                }),
                &[scan],
            )
            .unwrap();
        let eval = Evaluator::new(&arena, &ctx);
        let result = eval.materialize(limit, None).unwrap();
        // One record per entity; both entities have exactly one anyway.
        assert_eq!(result.table.num_rows(), 2);
        assert!(result.table.is_sorted_by(&[1]));
    }
}
