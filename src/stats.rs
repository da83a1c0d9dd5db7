use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the receive worker and the batch processors.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Deliveries taken off broker queues.
    pub received: AtomicU64,
    /// Records accepted into the internal queue.
    pub enqueued: AtomicU64,
    /// Records dropped because the internal queue was full.
    pub dropped: AtomicU64,
    /// Bodies that could not be decoded.
    pub decode_failures: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub decode_failures: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub batches: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn incr(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}
