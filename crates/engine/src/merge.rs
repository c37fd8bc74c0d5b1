//! Parallel multiway merge of sorted block streams.
//!
//! The inputs are iterators over sorted blocks (`Vec<T>`); the output is
//! again an iterator over sorted blocks that concatenate to the merged
//! sequence. The recursive merge tree spawns one worker thread per internal
//! binary-merge node; each worker feeds its parent through a bounded queue
//! with room for one block, which yields pipelined parallelism with no shared
//! mutable state beyond the queues. Memory is bounded: with `n` inputs and
//! block size `b`, every node retains at most one block per edge, so the
//! total number of retained elements stays in `O(n · b)`.

use crossbeam_channel::bounded;

pub type BlockIter<T> = Box<dyn Iterator<Item = Vec<T>> + Send>;

/// Merge the presorted `inputs` by `less`. `memory_limit_elements` bounds the
/// retained elements of the whole merge tree and determines the block size.
pub fn parallel_multiway_merge<T, F>(
    memory_limit_elements: usize,
    inputs: Vec<BlockIter<T>>,
    less: F,
) -> BlockIter<T>
where
    T: Send + 'static,
    F: Fn(&T, &T) -> bool + Clone + Send + 'static,
{
    if inputs.is_empty() {
        return Box::new(std::iter::empty());
    }
    // One block can be in flight per tree edge (two edges per internal
    // node), plus one being built per node.
    let block_size = (memory_limit_elements / (4 * inputs.len())).max(1);
    merge_recursive(block_size, inputs, less)
}

fn merge_recursive<T, F>(block_size: usize, mut inputs: Vec<BlockIter<T>>, less: F) -> BlockIter<T>
where
    T: Send + 'static,
    F: Fn(&T, &T) -> bool + Clone + Send + 'static,
{
    match inputs.len() {
        0 => Box::new(std::iter::empty()),
        1 => {
            let input = inputs.pop().expect("one input is present");
            Box::new(Rebatch::new(block_size, input))
        }
        2 => {
            let right = inputs.pop().expect("two inputs are present");
            let left = inputs.pop().expect("two inputs are present");
            Box::new(BinaryMerge::new(block_size, left, right, less))
        }
        n => {
            let tail = inputs.split_off(n / 2);
            // Both halves run asynchronously; the binary merge node reads
            // from their queues.
            let left = run_stream_async(merge_recursive(block_size, inputs, less.clone()));
            let right = run_stream_async(merge_recursive(block_size, tail, less.clone()));
            Box::new(BinaryMerge::new(block_size, left, right, less))
        }
    }
}

/// Move an iterator onto its own worker thread, exposing it through a
/// bounded queue with capacity for a single block.
fn run_stream_async<T: Send + 'static>(input: BlockIter<T>) -> BlockIter<T> {
    let (tx, rx) = bounded(1);
    std::thread::Builder::new()
        .name("multiway-merge".to_string())
        .spawn(move || {
            for block in input {
                if tx.send(block).is_err() {
                    // Consumer is gone; stop producing.
                    return;
                }
            }
        })
        .expect("spawning a merge worker cannot fail");
    Box::new(rx.into_iter())
}

/// Re-chunk one block stream to the target block size.
struct Rebatch<T> {
    block_size: usize,
    input: BlockIter<T>,
    pending: std::vec::IntoIter<T>,
}

impl<T> Rebatch<T> {
    fn new(block_size: usize, input: BlockIter<T>) -> Rebatch<T> {
        Rebatch {
            block_size,
            input,
            pending: Vec::new().into_iter(),
        }
    }
}

impl<T> Iterator for Rebatch<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Vec<T>> {
        let mut block = Vec::with_capacity(self.block_size);
        while block.len() < self.block_size {
            match self.pending.next() {
                Some(element) => block.push(element),
                None => match self.input.next() {
                    Some(next_block) => self.pending = next_block.into_iter(),
                    None => break,
                },
            }
        }
        (!block.is_empty()).then_some(block)
    }
}

/// The zipper over two sorted block streams.
struct BinaryMerge<T, F> {
    block_size: usize,
    left: Peekable<T>,
    right: Peekable<T>,
    less: F,
}

impl<T, F> BinaryMerge<T, F> {
    fn new(block_size: usize, left: BlockIter<T>, right: BlockIter<T>, less: F) -> Self {
        BinaryMerge {
            block_size,
            left: Peekable::new(left),
            right: Peekable::new(right),
            less,
        }
    }
}

impl<T, F> Iterator for BinaryMerge<T, F>
where
    F: Fn(&T, &T) -> bool,
{
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Vec<T>> {
        let mut block = Vec::with_capacity(self.block_size);
        while block.len() < self.block_size {
            match (self.left.peek(), self.right.peek()) {
                (Some(a), Some(b)) => {
                    // Take from the left on ties to keep the merge stable.
                    if (self.less)(b, a) {
                        block.push(self.right.next_element().expect("peeked"));
                    } else {
                        block.push(self.left.next_element().expect("peeked"));
                    }
                }
                (Some(_), None) => block.push(self.left.next_element().expect("peeked")),
                (None, Some(_)) => block.push(self.right.next_element().expect("peeked")),
                (None, None) => break,
            }
        }
        (!block.is_empty()).then_some(block)
    }
}

/// Element-level peeking over a block stream, holding at most one block.
struct Peekable<T> {
    input: BlockIter<T>,
    buffer: std::vec::IntoIter<T>,
    head: Option<T>,
}

impl<T> Peekable<T> {
    fn new(input: BlockIter<T>) -> Peekable<T> {
        Peekable {
            input,
            buffer: Vec::new().into_iter(),
            head: None,
        }
    }

    fn fill(&mut self) {
        while self.head.is_none() {
            if let Some(element) = self.buffer.next() {
                self.head = Some(element);
                return;
            }
            match self.input.next() {
                Some(block) => self.buffer = block.into_iter(),
                None => return,
            }
        }
    }

    fn peek(&mut self) -> Option<&T> {
        self.fill();
        self.head.as_ref()
    }

    fn next_element(&mut self) -> Option<T> {
        self.fill();
        self.head.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn blocks_of(values: &[i64], block: usize) -> BlockIter<i64> {
        let blocks: Vec<Vec<i64>> = values.chunks(block.max(1)).map(<[i64]>::to_vec).collect();
        Box::new(blocks.into_iter())
    }

    fn merge_all(inputs: Vec<Vec<i64>>, limit: usize) -> Vec<i64> {
        let iters = inputs
            .iter()
            .map(|input| blocks_of(input, 3))
            .collect::<Vec<_>>();
        parallel_multiway_merge(limit, iters, |a, b| a < b)
            .flatten()
            .collect()
    }

    #[test]
    fn merges_three_inputs() {
        let merged = merge_all(
            vec![vec![1, 4, 7], vec![2, 5, 8], vec![0, 3, 6, 9]],
            1000,
        );
        assert_eq!(merged, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn empty_and_single_inputs() {
        assert_eq!(merge_all(vec![], 100), Vec::<i64>::new());
        assert_eq!(merge_all(vec![vec![], vec![1, 2]], 100), vec![1, 2]);
        assert_eq!(merge_all(vec![vec![5, 6]], 100), vec![5, 6]);
    }

    #[test]
    fn block_sizes_respect_memory_limit() {
        let inputs: Vec<Vec<i64>> = (0..4).map(|k| (0..50).map(|i| i * 4 + k).collect()).collect();
        let iters = inputs
            .iter()
            .map(|input| blocks_of(input, 7))
            .collect::<Vec<_>>();
        // 4 inputs, 64-element budget: blocks of at most 4 elements.
        let blocks: Vec<Vec<i64>> =
            parallel_multiway_merge(64, iters, |a, b| a < b).collect();
        assert!(blocks.iter().all(|b| b.len() <= 4));
        let merged: Vec<i64> = blocks.into_iter().flatten().collect();
        assert_eq!(merged, (0..200).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn merged_output_is_sorted_permutation(
            inputs in prop::collection::vec(prop::collection::vec(-100i64..100, 0..40), 1..6)
        ) {
            let sorted_inputs: Vec<Vec<i64>> = inputs
                .iter()
                .map(|input| {
                    let mut sorted = input.clone();
                    sorted.sort_unstable();
                    sorted
                })
                .collect();
            let merged = merge_all(sorted_inputs.clone(), 128);
            let mut expected: Vec<i64> = sorted_inputs.into_iter().flatten().collect();
            expected.sort_unstable();
            prop_assert_eq!(merged, expected);
        }
    }
}
