use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Byte counters of one active download plus its cancellation switch.
///
/// Clones share state: the transfer writes, any number of observers read
/// without blocking it.
#[derive(Debug, Clone)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

#[derive(Debug)]
struct ProgressInner {
    completed: AtomicU64,
    total: AtomicU64,
    finished: AtomicBool,
    cancel: CancellationToken,
}

impl Progress {
    pub fn indeterminate() -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                completed: AtomicU64::new(0),
                total: AtomicU64::new(UNKNOWN_TOTAL),
                finished: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// `None` while the size is unknown.
    pub fn total(&self) -> Option<u64> {
        match self.inner.total.load(Ordering::Relaxed) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.total().is_none()
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.inner
            .total
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
    }

    pub fn advance(&self, bytes: u64) {
        self.inner.completed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn complete(&self) {
        let completed = self.completed();
        match self.total() {
            Some(total) => self.inner.completed.store(total, Ordering::Relaxed),
            None => self.set_total(Some(completed)),
        }
        self.inner.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn fraction(&self) -> Option<f64> {
        let total = self.total()?;
        if total == 0 {
            return Some(if self.is_finished() { 1.0 } else { 0.0 });
        }
        Some(self.completed() as f64 / total as f64)
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once [`Progress::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await;
    }

    pub fn same_transfer(&self, other: &Progress) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::indeterminate()
    }
}
