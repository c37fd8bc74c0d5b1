//! Query results: fully materialized tables or lazy block sequences.
//!
//! A lazy result is a single-consumption sequence of [`Block`]s. Each block
//! is internally sorted by the result's sort columns and the last row of
//! block *i* compares less-or-equal to the first row of block *i+1*, so the
//! concatenation of all blocks equals the materialized result. Double
//! consumption is a programming error and trapped by a one-shot flag.

use std::sync::Arc;

use rdf_model::{Id, LocalVocab, Tag};
use tracing::debug;

use crate::cancellation::CancellationHandle;
use crate::error::{EngineResult, QueryError};
use crate::idtable::{ColumnIndex, IdTable};
use crate::memory::MemoryLimit;

/// One chunk of a lazy result. Tables are shared so that a materialized
/// result can be re-exposed as a single block without copying.
#[derive(Debug, Clone)]
pub struct Block {
    pub table: Arc<IdTable>,
    pub vocab: Arc<LocalVocab>,
}

pub type BlockStream = Box<dyn Iterator<Item = EngineResult<Block>> + Send>;

/// Fully computed result; this is the only form the cache stores.
#[derive(Debug, Clone)]
pub struct MaterializedResult {
    pub table: Arc<IdTable>,
    pub sorted_by: Vec<ColumnIndex>,
    pub vocab: Arc<LocalVocab>,
}

impl MaterializedResult {
    /// Approximate heap footprint, used for cache sizing.
    pub fn size_bytes(&self) -> usize {
        self.table.column_bytes()
    }
}

/// A lazy result: sort columns plus a one-shot block stream.
pub struct LazyResult {
    sorted_by: Vec<ColumnIndex>,
    stream: Option<BlockStream>,
}

impl LazyResult {
    pub fn new(sorted_by: Vec<ColumnIndex>, stream: BlockStream) -> LazyResult {
        LazyResult {
            sorted_by,
            stream: Some(stream),
        }
    }

    pub fn sorted_by(&self) -> &[ColumnIndex] {
        &self.sorted_by
    }

    /// Hand out the stream; the second call is a contract violation.
    pub fn take_stream(&mut self) -> EngineResult<BlockStream> {
        self.stream.take().ok_or_else(|| {
            QueryError::ContractViolation("lazy result consumed twice".to_string())
        })
    }
}

impl std::fmt::Debug for LazyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyResult")
            .field("sorted_by", &self.sorted_by)
            .field("consumed", &self.stream.is_none())
            .finish()
    }
}

/// Either form of a result, as produced by an operator's compute step.
#[derive(Debug)]
pub enum QueryResult {
    Materialized(MaterializedResult),
    Lazy(LazyResult),
}

impl QueryResult {
    pub fn materialized(
        table: IdTable,
        sorted_by: Vec<ColumnIndex>,
        vocab: LocalVocab,
    ) -> QueryResult {
        debug_assert!(table.is_sorted_by(&sorted_by));
        QueryResult::Materialized(MaterializedResult {
            table: Arc::new(table),
            sorted_by,
            vocab: Arc::new(vocab),
        })
    }

    pub fn from_cached(cached: MaterializedResult) -> QueryResult {
        QueryResult::Materialized(cached)
    }

    pub fn is_fully_materialized(&self) -> bool {
        matches!(self, QueryResult::Materialized(_))
    }

    pub fn sorted_by(&self) -> &[ColumnIndex] {
        match self {
            QueryResult::Materialized(result) => &result.sorted_by,
            QueryResult::Lazy(result) => result.sorted_by(),
        }
    }

    /// Consume as a block stream; a materialized result becomes one block.
    pub fn into_blocks(self) -> EngineResult<BlockStream> {
        match self {
            QueryResult::Materialized(result) => {
                let block = Block {
                    table: result.table,
                    vocab: result.vocab,
                };
                Ok(Box::new((!block.table.is_empty()).then_some(Ok(block)).into_iter()))
            }
            QueryResult::Lazy(mut result) => result.take_stream(),
        }
    }

    /// Drain all blocks into one table, merging local vocabularies.
    pub fn into_materialized(self, limit: &MemoryLimit) -> EngineResult<MaterializedResult> {
        match self {
            QueryResult::Materialized(result) => Ok(result),
            QueryResult::Lazy(mut lazy) => {
                let sorted_by = lazy.sorted_by().to_vec();
                let stream = lazy.take_stream()?;
                let mut aggregate: Option<IdTable> = None;
                let mut vocab = VocabAccumulator::new();
                for block in stream {
                    let block = block?;
                    let remap = vocab.absorb(&block.vocab);
                    let target = aggregate.get_or_insert_with(|| {
                        IdTable::new(block.table.num_columns(), limit.clone())
                    });
                    append_block(target, &block.table, remap.as_deref())?;
                }
                let table = aggregate.unwrap_or_else(|| IdTable::new(0, limit.clone()));
                Ok(MaterializedResult {
                    table: Arc::new(table),
                    sorted_by,
                    vocab: Arc::new(vocab.into_vocab()),
                })
            }
        }
    }
}

fn append_block(target: &mut IdTable, block: &IdTable, remap: Option<&[u64]>) -> EngineResult<()> {
    for row in 0..block.num_rows() {
        let mut values = block.row_vec(row);
        if let Some(remap) = remap {
            for value in &mut values {
                *value = remap_id(*value, remap);
            }
        }
        target.push_row(&values)?;
    }
    Ok(())
}

fn remap_id(id: Id, remap: &[u64]) -> Id {
    match id.local_vocab_index_value() {
        Some(old) => Id::local_vocab_index(remap.get(old as usize).copied().unwrap_or(old)),
        None => id,
    }
}

/// Accumulates the local vocabularies of a block sequence. The accumulated
/// vocabulary stays stable as the base, so ids already copied never move;
/// each absorbed block gets a remap table for its own ids (or `None` when
/// the block's ids are already correct).
pub struct VocabAccumulator {
    vocab: LocalVocab,
    last_ptr: Option<*const LocalVocab>,
    last_remap: Option<Vec<u64>>,
}

// The raw pointer is only used for identity comparison.
unsafe impl Send for VocabAccumulator {}

impl VocabAccumulator {
    pub fn new() -> VocabAccumulator {
        VocabAccumulator {
            vocab: LocalVocab::new(),
            last_ptr: None,
            last_remap: None,
        }
    }

    pub fn absorb(&mut self, block_vocab: &Arc<LocalVocab>) -> Option<Vec<u64>> {
        let ptr = Arc::as_ptr(block_vocab);
        if self.last_ptr == Some(ptr) && self.vocab.len() >= block_vocab.len() {
            return self.last_remap.clone();
        }
        let remap = if self.vocab.is_empty() {
            self.vocab = (**block_vocab).clone();
            None
        } else {
            let table: Vec<u64> = (0..block_vocab.len() as u64)
                .map(|index| {
                    let word = block_vocab.word(index).unwrap_or_default();
                    self.vocab
                        .get_or_add(word)
                        .local_vocab_index_value()
                        .unwrap_or(index)
                })
                .collect();
            let identity = table.iter().enumerate().all(|(i, &v)| i as u64 == v);
            (!identity).then_some(table)
        };
        self.last_ptr = Some(ptr);
        self.last_remap = remap.clone();
        remap
    }

    /// Rewrite one id according to the remap returned by [`absorb`].
    pub fn map_id(id: Id, remap: Option<&[u64]>) -> Id {
        match remap {
            Some(table) if id.tag() == Tag::LocalVocabIndex => remap_id(id, table),
            _ => id,
        }
    }

    pub fn vocab(&self) -> &LocalVocab {
        &self.vocab
    }

    pub fn into_vocab(self) -> LocalVocab {
        self.vocab
    }
}

impl Default for VocabAccumulator {
    fn default() -> VocabAccumulator {
        VocabAccumulator::new()
    }
}

// ---------------------------------------------------------------------------
// Callback producer -> stream adapter
// ---------------------------------------------------------------------------

/// Sink handed to a callback-style producer running on its own worker.
pub struct BlockSink {
    tx: crossbeam_channel::Sender<EngineResult<Block>>,
}

impl BlockSink {
    /// Push a block; returns false once the consumer has gone away, which
    /// the producer must treat as "finished".
    pub fn push(&self, block: Block) -> bool {
        self.tx.send(Ok(block)).is_ok()
    }

    pub fn fail(&self, error: QueryError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Run `producer` on a worker thread and expose its pushed blocks as a
/// stream. The bounded queue makes producer and consumer alternate; dropping
/// the consumer disconnects the channel and the producer observes the next
/// failed push.
pub fn callback_to_stream<F>(queue_size: usize, producer: F) -> BlockStream
where
    F: FnOnce(&BlockSink) + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(queue_size.max(1));
    std::thread::Builder::new()
        .name("lazy-producer".to_string())
        .spawn(move || {
            let sink = BlockSink { tx };
            producer(&sink);
        })
        .expect("spawning a producer thread cannot fail");
    Box::new(rx.into_iter())
}

/// Wrap `stream` so that blocks are mirrored into an in-memory aggregate
/// while the consumer reads. When the stream finishes, the aggregate is
/// handed to `on_complete`. If mirroring hits the memory limit, caching is
/// abandoned silently and consumption continues unaffected.
pub fn cache_during_consumption<F>(
    stream: BlockStream,
    sorted_by: Vec<ColumnIndex>,
    limit: MemoryLimit,
    cancellation: Arc<CancellationHandle>,
    on_complete: F,
) -> BlockStream
where
    F: FnMut(MaterializedResult) + Send + 'static,
{
    Box::new(CachingStream {
        inner: stream,
        sorted_by,
        limit,
        cancellation,
        aggregate: None,
        vocab: VocabAccumulator::new(),
        copying: true,
        on_complete,
        done: false,
    })
}

struct CachingStream<F: FnMut(MaterializedResult)> {
    inner: BlockStream,
    sorted_by: Vec<ColumnIndex>,
    limit: MemoryLimit,
    cancellation: Arc<CancellationHandle>,
    aggregate: Option<IdTable>,
    vocab: VocabAccumulator,
    copying: bool,
    on_complete: F,
    done: bool,
}

impl<F: FnMut(MaterializedResult)> Iterator for CachingStream<F> {
    type Item = EngineResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok(block)) => {
                if self.copying && self.cancellation.check("caching result").is_ok() {
                    let remap = self.vocab.absorb(&block.vocab);
                    let target = self.aggregate.get_or_insert_with(|| {
                        IdTable::new(block.table.num_columns(), self.limit.clone())
                    });
                    if append_block(target, &block.table, remap.as_deref()).is_err() {
                        debug!("result too large to cache, continuing without caching");
                        self.copying = false;
                        self.aggregate = None;
                    }
                }
                Some(Ok(block))
            }
            Some(Err(error)) => {
                self.done = true;
                Some(Err(error))
            }
            None => {
                self.done = true;
                if self.copying {
                    let table = self
                        .aggregate
                        .take()
                        .unwrap_or_else(|| IdTable::new(0, self.limit.clone()));
                    let vocab = std::mem::take(&mut self.vocab).into_vocab();
                    (self.on_complete)(MaterializedResult {
                        table: Arc::new(table),
                        sorted_by: std::mem::take(&mut self.sorted_by),
                        vocab: Arc::new(vocab),
                    });
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: i64) -> Id {
        Id::int(value).unwrap()
    }

    fn block(values: &[i64]) -> Block {
        let mut table = IdTable::new(1, MemoryLimit::unlimited());
        for &v in values {
            table.push_row(&[id(v)]).unwrap();
        }
        Block {
            table: Arc::new(table),
            vocab: Arc::new(LocalVocab::new()),
        }
    }

    #[test]
    fn double_consumption_is_trapped() {
        let mut lazy = LazyResult::new(vec![0], Box::new(std::iter::empty()));
        lazy.take_stream().unwrap();
        assert!(matches!(
            lazy.take_stream(),
            Err(QueryError::ContractViolation(_))
        ));
    }

    #[test]
    fn lazy_materializes_to_concatenation() {
        let blocks = vec![Ok(block(&[1, 2])), Ok(block(&[3]))];
        let lazy = QueryResult::Lazy(LazyResult::new(vec![0], Box::new(blocks.into_iter())));
        let limit = MemoryLimit::unlimited();
        let materialized = lazy.into_materialized(&limit).unwrap();
        assert_eq!(materialized.table.column(0), &[id(1), id(2), id(3)]);
        assert_eq!(materialized.sorted_by, vec![0]);
    }

    #[test]
    fn callback_adapter_streams_blocks() {
        let stream = callback_to_stream(1, |sink| {
            sink.push(block(&[1]));
            sink.push(block(&[2]));
        });
        let rows: Vec<i64> = stream
            .map(|b| b.unwrap().table.at(0, 0).as_int().unwrap())
            .collect();
        assert_eq!(rows, vec![1, 2]);
    }

    #[test]
    fn callback_adapter_observes_dropped_consumer() {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let stream = callback_to_stream(1, move |sink| {
            let mut pushed = 0;
            while sink.push(block(&[pushed])) {
                pushed += 1;
                if pushed > 1000 {
                    break;
                }
            }
            let _ = done_tx.send(pushed);
        });
        drop(stream);
        // Producer exits long before the 1000-block safety valve.
        let pushed = done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert!(pushed <= 1000);
    }

    #[test]
    fn caching_stream_mirrors_blocks() {
        let blocks: Vec<EngineResult<Block>> = vec![Ok(block(&[1])), Ok(block(&[2]))];
        let (tx, rx) = crossbeam_channel::unbounded();
        let wrapped = cache_during_consumption(
            Box::new(blocks.into_iter()),
            vec![0],
            MemoryLimit::unlimited(),
            CancellationHandle::new(),
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert_eq!(wrapped.count(), 2);
        let cached = rx.try_recv().unwrap();
        assert_eq!(cached.table.column(0), &[id(1), id(2)]);
    }

    #[test]
    fn caching_aborts_silently_on_memory_limit() {
        let blocks: Vec<EngineResult<Block>> = vec![Ok(block(&[1])), Ok(block(&[2]))];
        let (tx, rx) = crossbeam_channel::unbounded();
        // Too small for the mirror copy, consumption must still see all blocks.
        let wrapped = cache_during_consumption(
            Box::new(blocks.into_iter()),
            vec![0],
            MemoryLimit::new(8),
            CancellationHandle::new(),
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert_eq!(wrapped.count(), 2);
        assert!(rx.try_recv().is_err());
    }
}
