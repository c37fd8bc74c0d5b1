//! Block-wise lazy join algorithms over single-column keys.
//!
//! Both algorithms consume two block streams whose blocks are sorted on the
//! join column and whose block boundaries respect the global order, and
//! produce a block stream with the same guarantees. The work runs on a
//! producer worker (the callback-to-stream adapter), so the consumer
//! overlaps with the join itself.

use std::sync::Arc;

use rdf_model::{Id, LocalVocab};

use crate::cancellation::CancellationTicker;
use crate::context::QueryContext;
use crate::error::EngineResult;
use crate::idtable::{ColumnIndex, IdTable};
use crate::result::{Block, BlockSink, BlockStream, LazyResult, QueryResult, VocabAccumulator};

use super::CHUNK_SIZE;

/// Element-wise cursor over one block stream, rewriting local-vocab ids into
/// a shared output vocabulary as blocks arrive.
struct Cursor {
    stream: BlockStream,
    block: Option<Block>,
    remap: Option<Vec<u64>>,
    row: usize,
}

impl Cursor {
    fn new(result: QueryResult) -> EngineResult<Cursor> {
        Ok(Cursor {
            stream: result.into_blocks()?,
            block: None,
            remap: None,
            row: 0,
        })
    }

    /// Make the current row valid; false when the stream is exhausted.
    fn ensure(&mut self, acc: &mut VocabAccumulator) -> EngineResult<bool> {
        loop {
            if let Some(block) = &self.block {
                if self.row < block.table.num_rows() {
                    return Ok(true);
                }
            }
            match self.stream.next() {
                None => {
                    self.block = None;
                    return Ok(false);
                }
                Some(block) => {
                    let block = block?;
                    self.remap = acc.absorb(&block.vocab);
                    self.block = Some(block);
                    self.row = 0;
                }
            }
        }
    }

    fn key(&self, col: ColumnIndex) -> Id {
        let block = self.block.as_ref().expect("ensure() was true");
        block.table.at(self.row, col)
    }

    fn row_mapped(&self) -> Vec<Id> {
        let block = self.block.as_ref().expect("ensure() was true");
        (0..block.table.num_columns())
            .map(|c| VocabAccumulator::map_id(block.table.at(self.row, c), self.remap.as_deref()))
            .collect()
    }

    fn advance(&mut self) {
        self.row += 1;
    }
}

/// Buffers output rows and flushes blocks of at most [`CHUNK_SIZE`] rows.
struct BlockWriter<'a> {
    sink: &'a BlockSink,
    table: IdTable,
    width: usize,
    ctx: &'a QueryContext,
    closed: bool,
}

impl<'a> BlockWriter<'a> {
    fn new(sink: &'a BlockSink, width: usize, ctx: &'a QueryContext) -> BlockWriter<'a> {
        BlockWriter {
            sink,
            table: IdTable::new(width, ctx.memory.clone()),
            width,
            ctx,
            closed: false,
        }
    }

    fn push(&mut self, row: &[Id], acc: &VocabAccumulator) -> EngineResult<bool> {
        self.table.push_row(row)?;
        if self.table.num_rows() >= CHUNK_SIZE {
            return self.flush(acc);
        }
        Ok(true)
    }

    fn flush(&mut self, acc: &VocabAccumulator) -> EngineResult<bool> {
        if self.table.is_empty() {
            return Ok(!self.closed);
        }
        let table = std::mem::replace(
            &mut self.table,
            IdTable::new(self.width, self.ctx.memory.clone()),
        );
        let block = Block {
            table: Arc::new(table),
            vocab: Arc::new(acc.vocab().clone()),
        };
        if !self.sink.push(block) {
            self.closed = true;
        }
        Ok(!self.closed)
    }
}

/// Lazy zipper join on one join column; both key columns must be free of
/// UNDEF (the planner checks the `mightContainUndef` statuses).
#[allow(clippy::too_many_arguments)]
pub(super) fn lazy_zipper_join(
    ctx: &QueryContext,
    left: QueryResult,
    l_col: ColumnIndex,
    l_width: usize,
    right: QueryResult,
    r_col: ColumnIndex,
    r_width: usize,
    sorted_on: Vec<ColumnIndex>,
) -> EngineResult<QueryResult> {
    let out_width = 1 + (l_width - 1) + (r_width - 1);
    let mut left_cursor = Cursor::new(left)?;
    let mut right_cursor = Cursor::new(right)?;
    let ctx_clone = ctx.clone();
    let queue_size = ctx.params.lazy_index_scan_queue_size;

    let stream = crate::result::callback_to_stream(queue_size, move |sink| {
        let ctx = ctx_clone;
        let mut acc = VocabAccumulator::new();
        let mut writer = BlockWriter::new(sink, out_width, &ctx);
        let mut ticker =
            CancellationTicker::new(Arc::clone(&ctx.cancellation), "lazy zipper join");
        let result = (|| -> EngineResult<()> {
            let mut left_ok = left_cursor.ensure(&mut acc)?;
            let mut right_ok = right_cursor.ensure(&mut acc)?;
            while left_ok && right_ok {
                ticker.tick()?;
                let lk = left_cursor.key(l_col);
                let rk = right_cursor.key(r_col);
                if lk < rk {
                    left_cursor.advance();
                    left_ok = left_cursor.ensure(&mut acc)?;
                } else if rk < lk {
                    right_cursor.advance();
                    right_ok = right_cursor.ensure(&mut acc)?;
                } else {
                    // Collect both equal-key runs; they may span blocks.
                    let key = lk;
                    let mut left_run: Vec<Vec<Id>> = Vec::new();
                    while left_ok && left_cursor.key(l_col) == key {
                        left_run.push(left_cursor.row_mapped());
                        left_cursor.advance();
                        left_ok = left_cursor.ensure(&mut acc)?;
                    }
                    let mut right_run: Vec<Vec<Id>> = Vec::new();
                    while right_ok && right_cursor.key(r_col) == key {
                        right_run.push(right_cursor.row_mapped());
                        right_cursor.advance();
                        right_ok = right_cursor.ensure(&mut acc)?;
                    }
                    for left_row in &left_run {
                        for right_row in &right_run {
                            ticker.tick()?;
                            let mut row = Vec::with_capacity(out_width);
                            row.push(key);
                            row.extend(
                                left_row
                                    .iter()
                                    .enumerate()
                                    .filter(|&(c, _)| c != l_col)
                                    .map(|(_, &id)| id),
                            );
                            row.extend(
                                right_row
                                    .iter()
                                    .enumerate()
                                    .filter(|&(c, _)| c != r_col)
                                    .map(|(_, &id)| id),
                            );
                            if !writer.push(&row, &acc)? {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            writer.flush(&acc)?;
            Ok(())
        })();
        if let Err(error) = result {
            sink.fail(error);
        }
    });
    Ok(QueryResult::Lazy(LazyResult::new(sorted_on, stream)))
}

/// Lazy MINUS on one join column. UNDEF never suppresses here: left rows
/// with an undefined key are always kept, right rows with an undefined key
/// are ignored, and both groups sort before every defined key.
pub(super) fn lazy_minus(
    ctx: &QueryContext,
    left: QueryResult,
    l_col: ColumnIndex,
    l_width: usize,
    right: QueryResult,
    r_col: ColumnIndex,
    sorted_on: Vec<ColumnIndex>,
) -> EngineResult<QueryResult> {
    let mut left_cursor = Cursor::new(left)?;
    let mut right_cursor = Cursor::new(right)?;
    let ctx_clone = ctx.clone();
    let queue_size = ctx.params.lazy_index_scan_queue_size;

    let stream = crate::result::callback_to_stream(queue_size, move |sink| {
        let ctx = ctx_clone;
        let mut acc = VocabAccumulator::new();
        let mut right_acc = VocabAccumulator::new();
        let mut writer = BlockWriter::new(sink, l_width, &ctx);
        let mut ticker = CancellationTicker::new(Arc::clone(&ctx.cancellation), "lazy minus");
        let result = (|| -> EngineResult<()> {
            let mut left_ok = left_cursor.ensure(&mut acc)?;
            let mut right_ok = right_cursor.ensure(&mut right_acc)?;
            // Left rows with an undefined key survive unconditionally.
            while left_ok && left_cursor.key(l_col).is_undefined() {
                if !writer.push(&left_cursor.row_mapped(), &acc)? {
                    return Ok(());
                }
                left_cursor.advance();
                left_ok = left_cursor.ensure(&mut acc)?;
            }
            // Right rows with an undefined key never suppress anything.
            while right_ok && right_cursor.key(r_col).is_undefined() {
                right_cursor.advance();
                right_ok = right_cursor.ensure(&mut right_acc)?;
            }
            while left_ok {
                ticker.tick()?;
                if !right_ok {
                    if !writer.push(&left_cursor.row_mapped(), &acc)? {
                        return Ok(());
                    }
                    left_cursor.advance();
                    left_ok = left_cursor.ensure(&mut acc)?;
                    continue;
                }
                let lk = left_cursor.key(l_col);
                let rk = right_cursor.key(r_col);
                if lk < rk {
                    if !writer.push(&left_cursor.row_mapped(), &acc)? {
                        return Ok(());
                    }
                    left_cursor.advance();
                    left_ok = left_cursor.ensure(&mut acc)?;
                } else if rk < lk {
                    right_cursor.advance();
                    right_ok = right_cursor.ensure(&mut right_acc)?;
                } else {
                    // Suppressed by a defined match on the right.
                    left_cursor.advance();
                    left_ok = left_cursor.ensure(&mut acc)?;
                }
            }
            writer.flush(&acc)?;
            Ok(())
        })();
        if let Err(error) = result {
            sink.fail(error);
        }
    });
    Ok(QueryResult::Lazy(LazyResult::new(sorted_on, stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLimit;
    use crate::result::LazyResult;

    fn id(v: i64) -> Id {
        Id::int(v).unwrap()
    }

    fn lazy_of(cols: Vec<Vec<i64>>, chunk: usize) -> QueryResult {
        // Column-major input: cols[c][r].
        let num_rows = cols.first().map_or(0, Vec::len);
        let mut blocks = Vec::new();
        let mut start = 0;
        while start < num_rows {
            let end = (start + chunk).min(num_rows);
            let columns: Vec<Vec<Id>> = cols
                .iter()
                .map(|col| col[start..end].iter().map(|&v| id(v)).collect())
                .collect();
            let table = IdTable::from_columns(columns, MemoryLimit::unlimited()).unwrap();
            blocks.push(Ok(Block {
                table: Arc::new(table),
                vocab: Arc::new(LocalVocab::new()),
            }));
            start = end;
        }
        QueryResult::Lazy(LazyResult::new(vec![0], Box::new(blocks.into_iter())))
    }

    fn ctx() -> QueryContext {
        QueryContext::new(Arc::new(index::IndexBuilder::default().build().unwrap()))
    }

    #[test]
    fn lazy_join_spanning_blocks() {
        let ctx = ctx();
        // Keys 2 appears twice on the left (split across blocks) and twice
        // on the right.
        let left = lazy_of(vec![vec![1, 2, 2, 3], vec![10, 20, 21, 30]], 2);
        let right = lazy_of(vec![vec![2, 2, 3], vec![200, 201, 300]], 2);
        let result = lazy_zipper_join(&ctx, left, 0, 2, right, 0, 2, vec![0]).unwrap();
        let materialized = result.into_materialized(&ctx.memory).unwrap();
        // 2x2 cross product for key 2 plus one match for key 3.
        assert_eq!(materialized.table.num_rows(), 5);
        assert!(materialized.table.is_sorted_by(&[0]));
        assert_eq!(materialized.table.column(0)[0], id(2));
        assert_eq!(materialized.table.column(0)[4], id(3));
    }

    #[test]
    fn lazy_minus_drops_defined_matches() {
        let ctx = ctx();
        let left = lazy_of(vec![vec![1, 2, 3, 4]], 2);
        let right = lazy_of(vec![vec![2, 4, 5]], 1);
        let result = lazy_minus(&ctx, left, 0, 1, right, 0, vec![0]).unwrap();
        let materialized = result.into_materialized(&ctx.memory).unwrap();
        assert_eq!(materialized.table.column(0), &[id(1), id(3)]);
    }

    #[test]
    fn lazy_minus_keeps_undef_left_rows() {
        let ctx = ctx();
        let mut table = IdTable::new(1, MemoryLimit::unlimited());
        table.push_row(&[Id::UNDEFINED]).unwrap();
        table.push_row(&[id(7)]).unwrap();
        let left = QueryResult::Lazy(LazyResult::new(
            vec![0],
            Box::new(std::iter::once(Ok(Block {
                table: Arc::new(table),
                vocab: Arc::new(LocalVocab::new()),
            }))),
        ));
        let right = lazy_of(vec![vec![7]], 1);
        let result = lazy_minus(&ctx, left, 0, 1, right, 0, vec![0]).unwrap();
        let materialized = result.into_materialized(&ctx.memory).unwrap();
        // The UNDEF row survives, the defined 7 is suppressed.
        assert_eq!(materialized.table.num_rows(), 1);
        assert!(materialized.table.at(0, 0).is_undefined());
    }
}
