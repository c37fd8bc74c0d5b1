//! Join algorithms shared by the join-family operators.
//!
//! All functions here work on join-column projections ([`IdTableView`]) of
//! inputs that are sorted on those projections. `Undefined` sorts before
//! every other id, which the UNDEF-aware variants exploit: rows carrying
//! `Undefined` in a join column are located with a secondary pass over
//! binary-searched candidate ranges instead of a full quadratic scan.

use std::cmp::Ordering;

use rdf_model::Id;

use crate::cancellation::CancellationTicker;
use crate::error::EngineResult;
use crate::idtable::IdTableView;

/// Called for every matching row pair (left row index, right row index).
pub type RowPairAction<'a> = &'a mut dyn FnMut(usize, usize) -> EngineResult<()>;

/// Plain zipper join of two sorted projections without UNDEF handling.
/// Equal-key runs on both sides produce the full cross product of the runs.
pub fn zipper_join(
    left: &IdTableView<'_>,
    right: &IdTableView<'_>,
    action: RowPairAction<'_>,
    ticker: &mut CancellationTicker,
) -> EngineResult<()> {
    zipper_join_on_rows(
        left,
        &dense(left.num_rows()),
        right,
        &dense(right.num_rows()),
        action,
        ticker,
    )
}

fn dense(n: usize) -> Vec<usize> {
    (0..n).collect()
}

fn zipper_join_on_rows(
    left: &IdTableView<'_>,
    left_rows: &[usize],
    right: &IdTableView<'_>,
    right_rows: &[usize],
    action: RowPairAction<'_>,
    ticker: &mut CancellationTicker,
) -> EngineResult<()> {
    let mut i = 0;
    let mut j = 0;
    while i < left_rows.len() && j < right_rows.len() {
        ticker.tick()?;
        match left.cmp_rows(left_rows[i], right, right_rows[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                // Extent of the equal-key runs on both sides.
                let run_left_end = run_end(left, left_rows, i);
                let run_right_end = run_end(right, right_rows, j);
                for &l in &left_rows[i..run_left_end] {
                    for &r in &right_rows[j..run_right_end] {
                        ticker.tick()?;
                        action(l, r)?;
                    }
                }
                i = run_left_end;
                j = run_right_end;
            }
        }
    }
    Ok(())
}

fn run_end(view: &IdTableView<'_>, rows: &[usize], start: usize) -> usize {
    let mut end = start + 1;
    while end < rows.len() && view.cmp_rows(rows[start], view, rows[end]) == Ordering::Equal {
        end += 1;
    }
    end
}

/// Is `row` compatible with `other_row` under UNDEF semantics: every join
/// column pair is equal or has `Undefined` on at least one side?
fn compatible(
    left: &IdTableView<'_>,
    left_row: usize,
    right: &IdTableView<'_>,
    right_row: usize,
) -> bool {
    (0..left.num_columns()).all(|c| {
        let a = left.at(left_row, c);
        let b = right.at(right_row, c);
        a == b || a.is_undefined() || b.is_undefined()
    })
}

fn has_undef(view: &IdTableView<'_>, row: usize) -> bool {
    (0..view.num_columns()).any(|c| view.at(row, c).is_undefined())
}

/// Candidate row ranges of `view` (sorted) that can be compatible with
/// `probe_row`. If the probe's first join column is defined, a compatible
/// row must carry either `Undefined` or exactly that value in its first
/// column: that is the leading UNDEF run plus one binary-searched equal
/// range. Rows outside these ranges cannot match, which keeps the secondary
/// pass far below a full quadratic scan.
fn candidate_ranges(
    view: &IdTableView<'_>,
    probe: &IdTableView<'_>,
    probe_row: usize,
) -> Vec<std::ops::Range<usize>> {
    let probe_first = probe.at(probe_row, 0);
    if probe_first.is_undefined() {
        return vec![0..view.num_rows()];
    }
    // Rows with an undefined first column sort before everything else.
    let undef_prefix = (0..view.num_rows())
        .take_while(|&row| view.at(row, 0).is_undefined())
        .count();
    let tail = view.num_rows() - undef_prefix;
    let eq_start = undef_prefix
        + partition_point(tail, |i| view.at(undef_prefix + i, 0) < probe_first);
    let eq_end = undef_prefix
        + partition_point(tail, |i| view.at(undef_prefix + i, 0) <= probe_first);
    vec![0..undef_prefix, eq_start..eq_end]
}

fn partition_point(len: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    let mut lo = 0;
    let mut hi = len;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Statistics of a zipper run with UNDEF handling.
pub struct ZipperOutcome {
    /// True if any pair was produced by the secondary UNDEF pass; such rows
    /// are not in sorted position and the caller must re-sort its output.
    pub out_of_order: bool,
}

/// Zipper join with UNDEF semantics: `Undefined` in a join column matches
/// any value on the other side. Exact matches of fully-defined rows come
/// from the plain zipper; rows carrying `Undefined` are matched through a
/// secondary pass over binary-searched candidate ranges.
///
/// `action(l, r)` receives every matching pair exactly once.
pub fn zipper_join_with_undef(
    left: &IdTableView<'_>,
    right: &IdTableView<'_>,
    left_may_undef: bool,
    right_may_undef: bool,
    action: RowPairAction<'_>,
    ticker: &mut CancellationTicker,
) -> EngineResult<ZipperOutcome> {
    if !left_may_undef && !right_may_undef {
        zipper_join(left, right, action, ticker)?;
        return Ok(ZipperOutcome {
            out_of_order: false,
        });
    }

    let mut left_defined = Vec::new();
    let mut left_undef = Vec::new();
    for row in 0..left.num_rows() {
        if has_undef(left, row) {
            left_undef.push(row);
        } else {
            left_defined.push(row);
        }
    }
    let mut right_defined = Vec::new();
    let mut right_undef = Vec::new();
    for row in 0..right.num_rows() {
        if has_undef(right, row) {
            right_undef.push(row);
        } else {
            right_defined.push(row);
        }
    }

    zipper_join_on_rows(left, &left_defined, right, &right_defined, action, ticker)?;

    let mut out_of_order = false;
    // Left rows with UNDEF against every compatible right row.
    for &l in &left_undef {
        for range in candidate_ranges(right, left, l) {
            for r in range {
                ticker.tick()?;
                if compatible(left, l, right, r) {
                    out_of_order = true;
                    action(l, r)?;
                }
            }
        }
    }
    // Right rows with UNDEF against compatible fully-defined left rows (the
    // pairs where both sides carry UNDEF were found above).
    for &r in &right_undef {
        for range in candidate_ranges(left, right, r) {
            for l in range {
                ticker.tick()?;
                if left_defined.binary_search(&l).is_ok() && compatible(left, l, right, r) {
                    out_of_order = true;
                    action(l, r)?;
                }
            }
        }
    }
    Ok(ZipperOutcome { out_of_order })
}

/// Existence probe for MINUS and friends: for every left row, whether some
/// right row agrees on all join columns, with the "only because of UNDEF"
/// exception — a match in which every column pair involves `Undefined` does
/// not count.
pub fn probe_existence(
    left: &IdTableView<'_>,
    right: &IdTableView<'_>,
    ticker: &mut CancellationTicker,
) -> EngineResult<Vec<bool>> {
    let mut exists = vec![false; left.num_rows()];
    {
        let mut action = |l: usize, r: usize| -> EngineResult<()> {
            if !exists[l] {
                let real_match = (0..left.num_columns()).any(|c| {
                    !left.at(l, c).is_undefined() && !right.at(r, c).is_undefined()
                });
                if real_match {
                    exists[l] = true;
                }
            }
            Ok(())
        };
        zipper_join_with_undef(left, right, true, true, &mut action, ticker)?;
    }
    Ok(exists)
}

/// Galloping existence probe against a sorted right projection, used when
/// the right side is an index scan that would be expensive to materialize
/// differently. No UNDEF participates by precondition.
pub fn nested_loop_existence(
    left: &IdTableView<'_>,
    right: &IdTableView<'_>,
    ticker: &mut CancellationTicker,
) -> EngineResult<Vec<bool>> {
    let mut exists = vec![false; left.num_rows()];
    for l in 0..left.num_rows() {
        ticker.tick()?;
        let found = partition_point(right.num_rows(), |r| {
            right.cmp_rows(r, left, l) == Ordering::Less
        });
        exists[l] = found < right.num_rows()
            && right.cmp_rows(found, left, l) == Ordering::Equal;
    }
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationHandle;
    use crate::idtable::IdTable;
    use crate::memory::MemoryLimit;

    fn id(v: i64) -> Id {
        Id::int(v).unwrap()
    }

    fn table(col: &[Option<i64>]) -> IdTable {
        let mut t = IdTable::new(1, MemoryLimit::unlimited());
        for v in col {
            t.push_row(&[v.map(|v| id(v)).unwrap_or(Id::UNDEFINED)]).unwrap();
        }
        t
    }

    fn ticker() -> CancellationTicker {
        CancellationTicker::new(CancellationHandle::new(), "test")
    }

    fn collect_pairs(
        left: &IdTable,
        right: &IdTable,
        left_undef: bool,
        right_undef: bool,
    ) -> Vec<(usize, usize)> {
        let cols = [0usize];
        let lv = left.view(&cols);
        let rv = right.view(&cols);
        let mut pairs = Vec::new();
        let mut action = |l: usize, r: usize| {
            pairs.push((l, r));
            Ok(())
        };
        zipper_join_with_undef(&lv, &rv, left_undef, right_undef, &mut action, &mut ticker())
            .unwrap();
        pairs.sort_unstable();
        pairs
    }

    #[test]
    fn plain_zipper_with_runs() {
        let left = table(&[Some(1), Some(2), Some(2), Some(4)]);
        let right = table(&[Some(2), Some(2), Some(3), Some(4)]);
        let pairs = collect_pairs(&left, &right, false, false);
        // The 2-runs cross-product (2x2) plus the single 4-match.
        assert_eq!(pairs, vec![(1, 0), (1, 1), (2, 0), (2, 1), (3, 3)]);
    }

    #[test]
    fn undef_on_left_matches_everything() {
        let left = table(&[None, Some(3)]);
        let right = table(&[Some(2), Some(3)]);
        let pairs = collect_pairs(&left, &right, true, false);
        assert_eq!(pairs, vec![(0, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn undef_on_both_sides_matches_once() {
        let left = table(&[None]);
        let right = table(&[None, Some(7)]);
        let pairs = collect_pairs(&left, &right, true, true);
        // The UNDEF-UNDEF pair and the UNDEF-7 pair, each exactly once.
        assert_eq!(pairs, vec![(0, 0), (0, 1)]);
    }

    #[test]
    fn existence_probe_ignores_undef_only_matches() {
        let left = table(&[None, Some(1), Some(2)]);
        let right = table(&[None, Some(2)]);
        let cols = [0usize];
        let exists =
            probe_existence(&left.view(&cols), &right.view(&cols), &mut ticker()).unwrap();
        // Row 0 matches only through UNDEF, row 1 has no defined match,
        // row 2 has the real match against 2.
        assert_eq!(exists, vec![false, false, true]);
    }

    #[test]
    fn nested_loop_probe() {
        let left = table(&[Some(1), Some(3), Some(5)]);
        let right = table(&[Some(2), Some(3), Some(3), Some(6)]);
        let cols = [0usize];
        let exists =
            nested_loop_existence(&left.view(&cols), &right.view(&cols), &mut ticker()).unwrap();
        assert_eq!(exists, vec![false, true, false]);
    }
}
