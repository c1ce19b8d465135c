use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters for a FIFO queue.
///
/// All counters use relaxed atomics; a snapshot is an estimate, consistent
/// with the queue's `size()` contract.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pushes: AtomicU64,
    pops: AtomicU64,
    buffer_growths: AtomicU64,
    consumer_relocations: AtomicU64,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_push(&self) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_pop(&self) {
        self.pops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_buffer_growth(&self) {
        self.buffer_growths.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_consumer_relocation(&self) {
        self.consumer_relocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pushes: self.pushes.load(Ordering::Relaxed),
            pops: self.pops.load(Ordering::Relaxed),
            buffer_growths: self.buffer_growths.load(Ordering::Relaxed),
            consumer_relocations: self.consumer_relocations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a queue's operation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Items enqueued.
    pub pushes: u64,
    /// Items dequeued.
    pub pops: u64,
    /// Producer buffers chained because a predecessor filled up.
    pub buffer_growths: u64,
    /// Consumer affinity moves between producers.
    pub consumer_relocations: u64,
}
