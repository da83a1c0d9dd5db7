use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PersistError;
use crate::queue::BoundedQueue;
use crate::record::LogRecord;
use crate::sink::LogSink;
use crate::stats::{incr, PipelineStats};

/// Result of persisting one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub persisted: usize,
    pub failed: usize,
}

/// Drains the internal queue in bounded batches and writes each record to
/// the sink.
///
/// A batch is flushed as soon as `batch_size` records are collected, or
/// when `batch_timeout` elapses with at least one record. Records are
/// persisted one at a time; a failed write is reported and the rest of the
/// batch carries on.
pub struct BatchProcessor {
    id: usize,
    queue: Arc<BoundedQueue<LogRecord>>,
    sink: Arc<dyn LogSink>,
    stats: Arc<PipelineStats>,
    batch_size: usize,
    batch_timeout: Duration,
}

impl BatchProcessor {
    pub fn new(
        id: usize,
        queue: Arc<BoundedQueue<LogRecord>>,
        sink: Arc<dyn LogSink>,
        stats: Arc<PipelineStats>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        BatchProcessor {
            id,
            queue,
            sink,
            stats,
            batch_size: batch_size.max(1),
            batch_timeout,
        }
    }

    /// Loop until `shutdown` fires. The signal is checked between batches;
    /// a batch that is being collected when it fires is still flushed.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(worker = self.id, "batch processor started");
        while !shutdown.is_cancelled() {
            let batch = self.collect(&shutdown).await;
            if batch.is_empty() {
                continue;
            }
            self.flush(batch).await;
        }
        if let Err(e) = self.sink.flush().await {
            tracing::warn!(worker = self.id, error = %e, "sink flush failed on shutdown");
        }
        tracing::debug!(worker = self.id, "batch processor stopped");
    }

    /// Gather up to `batch_size` records, waiting at most `batch_timeout`.
    pub async fn collect(&self, shutdown: &CancellationToken) -> Vec<LogRecord> {
        let deadline = Instant::now() + self.batch_timeout;
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = self.queue.pop_until(deadline) => next,
            };
            match next {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        batch
    }

    /// Persist every record in `batch` independently.
    pub async fn flush(&self, batch: Vec<LogRecord>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for record in &batch {
            match self.sink.persist(record).await {
                Ok(()) => {
                    incr(&self.stats.persisted);
                    outcome.persisted += 1;
                }
                Err(source) => {
                    incr(&self.stats.persist_failures);
                    outcome.failed += 1;
                    let e = PersistError {
                        service: record.service().to_string(),
                        source,
                    };
                    tracing::error!(worker = self.id, log_level = %record.level(), error = %e, "log record lost");
                }
            }
        }
        incr(&self.stats.batches);
        tracing::debug!(
            worker = self.id,
            size = batch.len(),
            persisted = outcome.persisted,
            failed = outcome.failed,
            "batch flushed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_sink::MemorySink;
    use crate::record::Level;

    fn record(message: &str) -> LogRecord {
        LogRecord::new("svc", Level::Info, message, None).unwrap()
    }

    fn processor(
        queue: &Arc<BoundedQueue<LogRecord>>,
        sink: MemorySink,
        batch_size: usize,
    ) -> BatchProcessor {
        BatchProcessor::new(
            0,
            Arc::clone(queue),
            Arc::new(sink),
            Arc::new(PipelineStats::default()),
            batch_size,
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_is_returned_without_waiting() {
        let queue = Arc::new(BoundedQueue::new(16));
        for i in 0..7 {
            queue.try_push(record(&i.to_string())).unwrap();
        }
        let p = processor(&queue, MemorySink::new(), 5);
        let start = Instant::now();
        let batch = p.collect(&CancellationToken::new()).await;
        assert_eq!(batch.len(), 5);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_after_timeout() {
        let queue = Arc::new(BoundedQueue::new(16));
        for i in 0..3 {
            queue.try_push(record(&i.to_string())).unwrap();
        }
        let p = processor(&queue, MemorySink::new(), 5);
        let start = Instant::now();
        let batch = p.collect(&CancellationToken::new()).await;
        assert_eq!(batch.len(), 3);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_timeout_produces_no_batch() {
        let queue = Arc::new(BoundedQueue::new(16));
        let p = processor(&queue, MemorySink::new(), 5);
        assert!(p.collect(&CancellationToken::new()).await.is_empty());
    }

    #[tokio::test]
    async fn one_failing_record_does_not_abort_batch() {
        let queue = Arc::new(BoundedQueue::new(16));
        let sink = MemorySink::new().failing_when(|r| r.message() == "bad");
        let p = processor(&queue, sink.clone(), 5);

        let batch = vec![record("a"), record("bad"), record("c"), record("d")];
        let outcome = p.flush(batch).await;

        assert_eq!(outcome, BatchOutcome { persisted: 3, failed: 1 });
        assert_eq!(sink.attempts(), 4);
        let messages: Vec<_> = sink.records().iter().map(|r| r.message().to_string()).collect();
        assert_eq!(messages, ["a", "c", "d"]);
        let stats = p.stats.snapshot();
        assert_eq!(stats.persisted, 3);
        assert_eq!(stats.persist_failures, 1);
        assert_eq!(stats.batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_on_shutdown_and_flushes_collected_records() {
        let queue = Arc::new(BoundedQueue::new(16));
        let sink = MemorySink::new();
        let p = processor(&queue, sink.clone(), 100);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(p.run(shutdown.clone()));

        queue.try_push(record("x")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(sink.len(), 1);
    }
}
