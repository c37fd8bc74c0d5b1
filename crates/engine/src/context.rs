//! Shared per-query execution context.

use std::sync::Arc;

use crate::cache::QueryCache;
use crate::cancellation::CancellationHandle;
use crate::memory::MemoryLimit;
use crate::params::RuntimeParameters;
use index::Index;

/// Everything an operator needs besides its inputs. The index and cache are
/// shared across queries; memory accounting and cancellation are per-query.
#[derive(Clone)]
pub struct QueryContext {
    pub index: Arc<Index>,
    pub params: RuntimeParameters,
    pub memory: MemoryLimit,
    pub cancellation: Arc<CancellationHandle>,
    pub cache: Arc<QueryCache>,
    /// Deterministic tie-breaking in the planner (used by tests).
    pub test_mode: bool,
}

impl QueryContext {
    pub fn new(index: Arc<Index>) -> QueryContext {
        let params = RuntimeParameters::default();
        let cache = Arc::new(QueryCache::new(&params));
        QueryContext {
            index,
            params,
            memory: MemoryLimit::unlimited(),
            cancellation: CancellationHandle::new(),
            cache,
            test_mode: false,
        }
    }

    pub fn with_params(mut self, params: RuntimeParameters) -> QueryContext {
        self.cache = Arc::new(QueryCache::new(&params));
        self.params = params;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> QueryContext {
        self.memory = MemoryLimit::new(bytes);
        self
    }

    pub fn with_cancellation(mut self, handle: Arc<CancellationHandle>) -> QueryContext {
        self.cancellation = handle;
        self
    }

    pub fn in_test_mode(mut self) -> QueryContext {
        self.test_mode = true;
        self
    }

    /// A fresh context for a new query sharing index and cache.
    pub fn fork_for_query(&self) -> QueryContext {
        QueryContext {
            index: Arc::clone(&self.index),
            params: self.params.clone(),
            memory: MemoryLimit::new(self.memory.cap()),
            cancellation: CancellationHandle::new(),
            cache: Arc::clone(&self.cache),
            test_mode: self.test_mode,
        }
    }
}
