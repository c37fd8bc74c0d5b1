//! Cooperative cancellation.
//!
//! One atomic state per query, shared by every operator. Row-level loops poll
//! through a [`CancellationTicker`] every `CHECK_INTERVAL` rows; block-level
//! loops call [`CancellationHandle::check`] once per block. A non-`Running`
//! state surfaces as [`QueryError::Cancelled`] and unwinds the call stack.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{CancelReason, EngineResult, QueryError};

/// How many rows a tight loop may process between two cancellation checks.
pub const CHECK_INTERVAL: usize = 1 << 20;

const RUNNING: u8 = 0;
const TIMEOUT: u8 = 1;
const MANUAL: u8 = 2;

#[derive(Debug)]
pub struct CancellationHandle {
    state: AtomicU8,
    deadline: Option<Instant>,
}

impl CancellationHandle {
    pub fn new() -> Arc<CancellationHandle> {
        Arc::new(CancellationHandle {
            state: AtomicU8::new(RUNNING),
            deadline: None,
        })
    }

    pub fn with_deadline(deadline: Instant) -> Arc<CancellationHandle> {
        Arc::new(CancellationHandle {
            state: AtomicU8::new(RUNNING),
            deadline: Some(deadline),
        })
    }

    /// Request a manual cancel; takes effect at the next suspension point.
    pub fn cancel(&self) {
        let _ = self
            .state
            .compare_exchange(RUNNING, MANUAL, Ordering::Relaxed, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Relaxed) != RUNNING
    }

    /// The suspension point. `phase` names the work that would be aborted.
    pub fn check(&self, phase: &'static str) -> EngineResult<()> {
        match self.state.load(Ordering::Relaxed) {
            RUNNING => {}
            TIMEOUT => {
                return Err(QueryError::Cancelled {
                    reason: CancelReason::Timeout,
                    phase,
                })
            }
            _ => {
                return Err(QueryError::Cancelled {
                    reason: CancelReason::Manual,
                    phase,
                })
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                let _ = self.state.compare_exchange(
                    RUNNING,
                    TIMEOUT,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                return Err(QueryError::Cancelled {
                    reason: CancelReason::Timeout,
                    phase,
                });
            }
        }
        Ok(())
    }
}

/// Per-loop throttle so tight loops only touch the atomic once per
/// [`CHECK_INTERVAL`] iterations.
pub struct CancellationTicker {
    handle: Arc<CancellationHandle>,
    phase: &'static str,
    counter: usize,
}

impl CancellationTicker {
    pub fn new(handle: Arc<CancellationHandle>, phase: &'static str) -> CancellationTicker {
        CancellationTicker {
            handle,
            phase,
            counter: 0,
        }
    }

    #[inline]
    pub fn tick(&mut self) -> EngineResult<()> {
        self.counter += 1;
        if self.counter >= CHECK_INTERVAL {
            self.counter = 0;
            self.handle.check(self.phase)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn manual_cancel_surfaces_at_check() {
        let handle = CancellationHandle::new();
        assert!(handle.check("test").is_ok());
        handle.cancel();
        let err = handle.check("computing join").unwrap_err();
        assert!(matches!(
            err,
            QueryError::Cancelled {
                reason: CancelReason::Manual,
                phase: "computing join"
            }
        ));
    }

    #[test]
    fn expired_deadline_turns_into_timeout() {
        let handle = CancellationHandle::with_deadline(Instant::now() - Duration::from_millis(1));
        let err = handle.check("scan").unwrap_err();
        assert!(matches!(
            err,
            QueryError::Cancelled {
                reason: CancelReason::Timeout,
                ..
            }
        ));
        // The state sticks: later checks keep reporting timeout.
        assert!(handle.is_cancelled());
    }

    #[test]
    fn ticker_throttles_checks() {
        let handle = CancellationHandle::new();
        let mut ticker = CancellationTicker::new(Arc::clone(&handle), "loop");
        handle.cancel();
        // The first CHECK_INTERVAL - 1 ticks do not observe the cancel.
        for _ in 0..CHECK_INTERVAL - 1 {
            assert!(ticker.tick().is_ok());
        }
        assert!(ticker.tick().is_err());
    }
}
