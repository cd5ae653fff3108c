use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Runtime metrics for a replay buffer.
///
/// A lightweight, read-only view over the producer activity of one buffer.
/// Obtain a `Stats` handle via `ReplayBuffer::stats()` or
/// `AsyncReplayBuffer::stats()`. Values use relaxed atomics and are intended
/// for diagnostics.
#[cfg_attr(docsrs, doc(cfg(feature = "stats")))]
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pulls: Arc<AtomicU64>,
    cancelled_pulls: Arc<AtomicU64>,
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_pull(&self) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled_pull(&self) {
        self.cancelled_pulls.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns how many times the producer has been advanced.
    ///
    /// The pull that observes the end of the sequence or a failure counts too,
    /// so fully draining `n` items reports `n + 1`.
    pub fn pulls(&self) -> u64 {
        self.pulls.load(Ordering::Relaxed)
    }

    /// Returns how many in-flight pulls were abandoned because the consumer
    /// that started them was cancelled. Always zero for synchronous buffers.
    pub fn cancelled_pulls(&self) -> u64 {
        self.cancelled_pulls.load(Ordering::Relaxed)
    }
}
