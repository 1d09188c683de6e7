//! Cooperative cancellation token shared by scans, vector search, and the
//! ingestion worker pool.
//!
//! Mirrors the teacher's `shutdown: Arc<AtomicBool>` pattern rather than
//! pulling in an async cancellation primitive — nothing in this crate runs
//! on an async runtime, so a polled flag checked at each suspension point
//! (a scan yield, a search worker's join, a batch boundary) is enough.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let t = CancellationToken::new();
        assert!(!t.is_cancelled());
    }

    #[test]
    fn cancel_is_visible_across_clones() {
        let t = CancellationToken::new();
        let t2 = t.clone();
        t.cancel();
        assert!(t2.is_cancelled());
    }
}
