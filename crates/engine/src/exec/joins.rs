//! The binary join-family operators: join, multi-column join, optional
//! join and minus, including the index-nested-loop specializations.

use rdf_model::{Id, LocalVocabMerger, MergeSide};

use crate::arena::{OpHandle, OpNode};
use crate::cancellation::CancellationTicker;
use crate::error::{EngineResult, QueryError};
use crate::idtable::{ColumnIndex, IdTable};
use crate::join::{
    nested_loop_existence, probe_existence, zipper_join_with_undef, ZipperOutcome,
};
use crate::operator::{
    IndexScanOp, JoinOp, MinusOp, MultiColumnJoinOp, Operator, OptionalJoinOp,
};
use crate::result::QueryResult;
use crate::variable::UndefStatus;

use super::{blockwise, Evaluator};

fn children_of(node: &OpNode) -> EngineResult<(OpHandle, OpHandle)> {
    match node.children.as_slice() {
        [left, right] => Ok((*left, *right)),
        _ => Err(QueryError::ContractViolation(
            "binary operator without two children".into(),
        )),
    }
}

fn rest_columns(width: usize, join_cols: impl Iterator<Item = ColumnIndex> + Clone) -> Vec<usize> {
    (0..width)
        .filter(|c| !join_cols.clone().any(|jc| jc == *c))
        .collect()
}

fn may_contain_undef(node: &OpNode, cols: impl IntoIterator<Item = ColumnIndex>) -> bool {
    cols.into_iter()
        .any(|c| node.var_map.undef_at(c) == UndefStatus::PossiblyUndef)
}

// ---------------------------------------------------------------------------
// Join (single column) and multi-column join
// ---------------------------------------------------------------------------

pub(super) fn compute_join(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &JoinOp,
    request_lazy: bool,
) -> EngineResult<QueryResult> {
    let (left_h, right_h) = children_of(node)?;
    let left_node = eval.node(left_h);
    let right_node = eval.node(right_h);
    let [l_col, r_col] = op.join_cols;
    let undef_possible =
        may_contain_undef(left_node, [l_col]) || may_contain_undef(right_node, [r_col]);

    // Index-nested-loop: small left side, right side a fresh index scan
    // whose first output column is the join column; probing by key avoids
    // materializing the scan.
    if !undef_possible && r_col == 0 {
        if let Operator::IndexScan(scan) = &right_node.op {
            if left_node.size_estimate < right_node.size_estimate {
                return index_nested_loop_join(eval, node, left_h, l_col, scan);
            }
        }
    }

    // Block-wise lazy zipper for defined single-column joins.
    if request_lazy
        && !undef_possible
        && left_node.supports_lazy
        && right_node.supports_lazy
    {
        let left = eval.evaluate(left_h, true, None)?;
        let right = eval.evaluate(right_h, true, None)?;
        return blockwise::lazy_zipper_join(
            eval.ctx,
            left,
            l_col,
            left_node.width(),
            right,
            r_col,
            right_node.width(),
            node.sorted_on.clone(),
        );
    }

    materialized_join(eval, node, left_h, right_h, &[[l_col, r_col]])
}

pub(super) fn compute_multi_column_join(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &MultiColumnJoinOp,
) -> EngineResult<QueryResult> {
    let (left_h, right_h) = children_of(node)?;
    materialized_join(eval, node, left_h, right_h, &op.join_cols)
}

fn materialized_join(
    eval: &Evaluator<'_>,
    node: &OpNode,
    left_h: OpHandle,
    right_h: OpHandle,
    join_cols: &[[ColumnIndex; 2]],
) -> EngineResult<QueryResult> {
    let left_node = eval.node(left_h);
    let right_node = eval.node(right_h);
    let left = eval.materialize(left_h, None)?;
    let right = eval.materialize(right_h, None)?;
    let merger = LocalVocabMerger::merge(&left.vocab, &right.vocab);

    let l_cols: Vec<usize> = join_cols.iter().map(|jc| jc[0]).collect();
    let r_cols: Vec<usize> = join_cols.iter().map(|jc| jc[1]).collect();
    let left_rest = rest_columns(left.table.num_columns(), l_cols.iter().copied());
    let right_rest = rest_columns(right.table.num_columns(), r_cols.iter().copied());

    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    let outcome;
    {
        let left_view = left.table.view(&l_cols);
        let right_view = right.table.view(&r_cols);
        let mut ticker = CancellationTicker::new(
            std::sync::Arc::clone(&eval.ctx.cancellation),
            "computing join",
        );
        let mut action = |l: usize, r: usize| -> EngineResult<()> {
            let mut row: Vec<Id> = Vec::with_capacity(node.width());
            for &[lc, rc] in join_cols {
                let lv = left.table.at(l, lc);
                if lv.is_undefined() {
                    row.push(merger.map_id(MergeSide::Right, right.table.at(r, rc)));
                } else {
                    row.push(merger.map_id(MergeSide::Left, lv));
                }
            }
            for &c in &left_rest {
                row.push(merger.map_id(MergeSide::Left, left.table.at(l, c)));
            }
            for &c in &right_rest {
                row.push(merger.map_id(MergeSide::Right, right.table.at(r, c)));
            }
            out.push_row(&row)
        };
        outcome = zipper_join_with_undef(
            &left_view,
            &right_view,
            may_contain_undef(left_node, l_cols.iter().copied()),
            may_contain_undef(right_node, r_cols.iter().copied()),
            &mut action,
            &mut ticker,
        )?;
    }
    finish_sorted(out, node, outcome)
        .map(|table| QueryResult::materialized(table, node.sorted_on.clone(), merger.into_vocab()))
}

/// Matches produced by the UNDEF pass are out of sorted position; restore
/// the declared sort order before publishing.
fn finish_sorted(mut out: IdTable, node: &OpNode, outcome: ZipperOutcome) -> EngineResult<IdTable> {
    if outcome.out_of_order {
        out.sort_by_columns(&node.sorted_on);
    }
    Ok(out)
}

fn index_nested_loop_join(
    eval: &Evaluator<'_>,
    node: &OpNode,
    left_h: OpHandle,
    l_col: ColumnIndex,
    scan: &IndexScanOp,
) -> EngineResult<QueryResult> {
    let left = eval.materialize(left_h, None)?;
    let left_rest = rest_columns(left.table.num_columns(), std::iter::once(l_col));
    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    let mut ticker = CancellationTicker::new(
        std::sync::Arc::clone(&eval.ctx.cancellation),
        "index-nested-loop join",
    );

    // Bind the join value as the next fixed key column of the probed scan.
    let order = scan.permutation.key_order();
    let num_bound = order
        .iter()
        .take_while(|&&pos| scan.fixed[pos].is_some())
        .count();
    let probe_pos = order[num_bound];

    for l in 0..left.table.num_rows() {
        ticker.tick()?;
        let value = left.table.at(l, l_col);
        let mut probed = scan.clone();
        probed.fixed[probe_pos] = Some(value);
        let (spec, existence_check) = super::scan::probe_spec(&probed);
        let blocks = eval.ctx.index.scan(&spec)?;
        if let Some(col2) = existence_check {
            // The probe bound the scan's last free position; only row
            // existence matters.
            let found = blocks
                .into_iter()
                .any(|block| block.columns[0].binary_search(&col2).is_ok());
            if found {
                let mut out_row: Vec<Id> = Vec::with_capacity(node.width());
                out_row.push(value);
                for &c in &left_rest {
                    out_row.push(left.table.at(l, c));
                }
                out.push_row(&out_row)?;
            }
            continue;
        }
        for block in blocks {
            for row in 0..block.num_rows() {
                let mut out_row: Vec<Id> = Vec::with_capacity(node.width());
                out_row.push(value);
                for &c in &left_rest {
                    out_row.push(left.table.at(l, c));
                }
                for c in 0..block.num_columns() {
                    out_row.push(block.columns[c][row]);
                }
                out.push_row(&out_row)?;
                ticker.tick()?;
            }
        }
    }
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        (*left.vocab).clone(),
    ))
}

// ---------------------------------------------------------------------------
// Optional join
// ---------------------------------------------------------------------------

pub(super) fn compute_optional_join(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &OptionalJoinOp,
) -> EngineResult<QueryResult> {
    let (left_h, right_h) = children_of(node)?;
    let left_node = eval.node(left_h);
    let right_node = eval.node(right_h);
    let left = eval.materialize(left_h, None)?;
    let right = eval.materialize(right_h, None)?;
    let merger = LocalVocabMerger::merge(&left.vocab, &right.vocab);

    let l_cols: Vec<usize> = op.join_cols.iter().map(|jc| jc[0]).collect();
    let r_cols: Vec<usize> = op.join_cols.iter().map(|jc| jc[1]).collect();
    let right_rest = rest_columns(right.table.num_columns(), r_cols.iter().copied());

    // Collect matches first; pairs arrive ordered by left row.
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    let outcome;
    {
        let left_view = left.table.view(&l_cols);
        let right_view = right.table.view(&r_cols);
        let mut ticker = CancellationTicker::new(
            std::sync::Arc::clone(&eval.ctx.cancellation),
            "computing optional join",
        );
        let mut action = |l: usize, r: usize| -> EngineResult<()> {
            pairs.push((l, r));
            Ok(())
        };
        outcome = zipper_join_with_undef(
            &left_view,
            &right_view,
            may_contain_undef(left_node, l_cols.iter().copied()),
            may_contain_undef(right_node, r_cols.iter().copied()),
            &mut action,
            &mut ticker,
        )?;
    }
    if outcome.out_of_order {
        pairs.sort_unstable();
    }

    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    let mut pair_pos = 0;
    for l in 0..left.table.num_rows() {
        eval.ctx.cancellation.check("computing optional join")?;
        let start = pair_pos;
        while pair_pos < pairs.len() && pairs[pair_pos].0 == l {
            pair_pos += 1;
        }
        if start == pair_pos {
            // No match: pad every right-only column with Undefined.
            let mut row: Vec<Id> = (0..left.table.num_columns())
                .map(|c| merger.map_id(MergeSide::Left, left.table.at(l, c)))
                .collect();
            row.extend(std::iter::repeat(Id::UNDEFINED).take(right_rest.len()));
            out.push_row(&row)?;
            continue;
        }
        for &(_, r) in &pairs[start..pair_pos] {
            let mut row: Vec<Id> = Vec::with_capacity(node.width());
            for c in 0..left.table.num_columns() {
                let value = left.table.at(l, c);
                // A join column that is UNDEF on the left takes the matched
                // right value.
                let join_pos = l_cols.iter().position(|&lc| lc == c);
                match join_pos {
                    Some(k) if value.is_undefined() => {
                        row.push(merger.map_id(MergeSide::Right, right.table.at(r, r_cols[k])));
                    }
                    _ => row.push(merger.map_id(MergeSide::Left, value)),
                }
            }
            for &c in &right_rest {
                row.push(merger.map_id(MergeSide::Right, right.table.at(r, c)));
            }
            out.push_row(&row)?;
        }
    }
    let table = finish_sorted(out, node, outcome)?;
    Ok(QueryResult::materialized(
        table,
        node.sorted_on.clone(),
        merger.into_vocab(),
    ))
}

// ---------------------------------------------------------------------------
// Minus
// ---------------------------------------------------------------------------

pub(super) fn compute_minus(
    eval: &Evaluator<'_>,
    _handle: OpHandle,
    node: &OpNode,
    op: &MinusOp,
    request_lazy: bool,
) -> EngineResult<QueryResult> {
    let (left_h, right_h) = children_of(node)?;
    let left_node = eval.node(left_h);
    let right_node = eval.node(right_h);

    if op.join_cols.is_empty() {
        // No shared variables: every left row survives iff the right side is
        // empty of matches, i.e. MINUS has no effect.
        return eval.evaluate(left_h, request_lazy, None);
    }

    // The lazy minus works on block streams when there is exactly one join
    // column.
    if request_lazy
        && op.join_cols.len() == 1
        && left_node.supports_lazy
        && right_node.supports_lazy
    {
        let left = eval.evaluate(left_h, true, None)?;
        let right = eval.evaluate(right_h, true, None)?;
        return blockwise::lazy_minus(
            eval.ctx,
            left,
            op.join_cols[0][0],
            left_node.width(),
            right,
            op.join_cols[0][1],
            node.sorted_on.clone(),
        );
    }

    let l_cols: Vec<usize> = op.join_cols.iter().map(|jc| jc[0]).collect();
    let r_cols: Vec<usize> = op.join_cols.iter().map(|jc| jc[1]).collect();

    let left = eval.materialize(left_h, None)?;
    let mut ticker = CancellationTicker::new(
        std::sync::Arc::clone(&eval.ctx.cancellation),
        "computing minus",
    );

    // Index-nested-loop existence probe: skip the right-hand Sort and probe
    // the scan directly when no UNDEF participates and the scan is already
    // ordered by the join columns.
    let exists = 'probe: {
        let always_defined = !may_contain_undef(left_node, l_cols.iter().copied())
            && !may_contain_undef(right_node, r_cols.iter().copied());
        if always_defined && left_node.size_estimate <= right_node.size_estimate {
            if let Operator::Sort(_) = &right_node.op {
                let inner_h = right_node.children[0];
                let inner = eval.node(inner_h);
                if matches!(inner.op, Operator::IndexScan(_))
                    && inner.sorted_on.starts_with(&r_cols)
                {
                    let right = eval.materialize(inner_h, None)?;
                    let left_view = left.table.view(&l_cols);
                    let right_view = right.table.view(&r_cols);
                    break 'probe nested_loop_existence(&left_view, &right_view, &mut ticker)?;
                }
            }
        }
        let right = eval.materialize(right_h, None)?;
        let left_view = left.table.view(&l_cols);
        let right_view = right.table.view(&r_cols);
        probe_existence(&left_view, &right_view, &mut ticker)?
    };

    let mut out = IdTable::new(node.width(), eval.ctx.memory.clone());
    for (row, exists) in exists.iter().enumerate() {
        if !exists {
            out.push_row(&left.table.row_vec(row))?;
        }
    }
    Ok(QueryResult::materialized(
        out,
        node.sorted_on.clone(),
        (*left.vocab).clone(),
    ))
}
