//! Per-query memory accounting.
//!
//! Every table allocation is routed through a [`MemoryLimit`] carved from the
//! global budget for one query. Exceeding the cap raises
//! [`QueryError::MemoryLimitExceeded`] synchronously from the allocating
//! operation; allocator state is never shared between queries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{EngineResult, QueryError};

#[derive(Debug)]
struct Inner {
    used: AtomicUsize,
    cap: usize,
}

/// Shared byte budget. Cloning shares the same accounting.
#[derive(Debug, Clone)]
pub struct MemoryLimit {
    inner: Arc<Inner>,
}

impl MemoryLimit {
    pub fn new(cap: usize) -> MemoryLimit {
        MemoryLimit {
            inner: Arc::new(Inner {
                used: AtomicUsize::new(0),
                cap,
            }),
        }
    }

    pub fn unlimited() -> MemoryLimit {
        MemoryLimit::new(usize::MAX)
    }

    pub fn cap(&self) -> usize {
        self.inner.cap
    }

    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }

    /// Account for `bytes` more. Fails without changing the accounting if the
    /// cap would be exceeded.
    pub fn try_reserve(&self, bytes: usize) -> EngineResult<()> {
        let mut current = self.inner.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.inner.cap {
                return Err(QueryError::MemoryLimitExceeded {
                    limit: self.inner.cap,
                    requested: bytes,
                });
            }
            match self.inner.used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        self.inner.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release() {
        let limit = MemoryLimit::new(100);
        limit.try_reserve(60).unwrap();
        assert_eq!(limit.used(), 60);
        let err = limit.try_reserve(50).unwrap_err();
        assert!(matches!(
            err,
            QueryError::MemoryLimitExceeded {
                limit: 100,
                requested: 50
            }
        ));
        // Failed reservation leaves the accounting untouched.
        assert_eq!(limit.used(), 60);
        limit.release(60);
        limit.try_reserve(100).unwrap();
    }
}
