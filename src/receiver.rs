use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::DeliveryStream;
use crate::connection::ConnectionManager;
use crate::error::PipelineError;
use crate::queue::BoundedQueue;
use crate::record::LogRecord;
use crate::retry::RetryPolicy;
use crate::stats::{incr, PipelineStats};

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    Enqueued,
    /// The internal queue was full; the record is gone.
    Dropped,
    /// The body was not a valid log record.
    Malformed,
}

/// Consumer ingress: pulls deliveries off the bound broker queues and
/// pushes decoded records into the internal queue.
///
/// Deliveries are auto-acked, so anything dropped here or lost before a
/// batch processor persists it is not redelivered.
pub struct ReceiveWorker {
    manager: Arc<ConnectionManager>,
    retry: RetryPolicy,
    queue: Arc<BoundedQueue<LogRecord>>,
    stats: Arc<PipelineStats>,
}

impl ReceiveWorker {
    pub fn new(
        manager: Arc<ConnectionManager>,
        retry: RetryPolicy,
        queue: Arc<BoundedQueue<LogRecord>>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        ReceiveWorker {
            manager,
            retry,
            queue,
            stats,
        }
    }

    /// Connect, declare topology and consume until `shutdown` fires or a
    /// delivery stream fails.
    ///
    /// **Returns**
    /// - `Ok(())` after a cooperative shutdown.
    /// - `Err(..)` when the connection could not be established or was
    ///   lost; the caller is expected to rebuild the pipeline.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let manager = &self.manager;
        let channel = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = self.retry.run("consumer connect", |_| manager.connect()) => result?,
        };

        let mut consumers = JoinSet::new();
        for binding in self.manager.bindings() {
            let stream = channel.consume(&binding.queue.name).await?;
            consumers.spawn(consume_queue(
                binding.queue.name.clone(),
                stream,
                Arc::clone(&self.queue),
                Arc::clone(&self.stats),
                shutdown.clone(),
            ));
        }
        tracing::info!(queues = consumers.len(), "receive worker consuming");

        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            Some(joined) = consumers.join_next() => match joined {
                Ok(result) => result,
                Err(e) => Err(PipelineError::Task(e)),
            },
        };
        consumers.shutdown().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "receive worker stopped");
        }
        result
    }
}

async fn consume_queue(
    queue_name: String,
    mut stream: Box<dyn DeliveryStream>,
    queue: Arc<BoundedQueue<LogRecord>>,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = stream.next_delivery() => next,
        };
        match next {
            Some(Ok(delivery)) => {
                handle_delivery(&queue_name, &delivery.body, &queue, &stats);
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(PipelineError::StreamEnded(queue_name)),
        }
    }
}

/// Decode one body and offer it to the internal queue without waiting.
pub fn handle_delivery(
    queue_name: &str,
    body: &[u8],
    queue: &BoundedQueue<LogRecord>,
    stats: &PipelineStats,
) -> Intake {
    incr(&stats.received);
    let record = match LogRecord::from_body(body) {
        Ok(record) => record,
        Err(e) => {
            incr(&stats.decode_failures);
            tracing::warn!(queue = queue_name, error = %e, "dropping malformed log message");
            return Intake::Malformed;
        }
    };

    match queue.try_push(record) {
        Ok(()) => {
            incr(&stats.enqueued);
            Intake::Enqueued
        }
        Err(record) => {
            let dropped = incr(&stats.dropped);
            tracing::warn!(
                queue = queue_name,
                service = record.service(),
                capacity = queue.capacity(),
                dropped,
                "internal queue full, dropping log record"
            );
            Intake::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, ConnectOptions, MessageProperties};
    use crate::config::BrokerSettings;
    use crate::memory::MemoryBroker;
    use crate::record::Level;
    use crate::topology::DEFAULT_EXCHANGE;
    use std::time::Duration;

    fn body(service: &str, message: &str) -> Vec<u8> {
        LogRecord::new(service, Level::Info, message, None)
            .unwrap()
            .to_body()
            .unwrap()
    }

    fn props() -> MessageProperties {
        MessageProperties {
            persistent: true,
            content_type: "application/json".into(),
            timestamp: 0,
        }
    }

    #[test]
    fn full_queue_drops_second_delivery() {
        let queue = BoundedQueue::new(1);
        let stats = PipelineStats::default();
        assert_eq!(handle_delivery("q", &body("a", "one"), &queue, &stats), Intake::Enqueued);
        assert_eq!(handle_delivery("q", &body("a", "two"), &queue, &stats), Intake::Dropped);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop().unwrap().message(), "one");
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.dropped, 1);
    }

    #[test]
    fn malformed_body_is_counted_and_skipped() {
        let queue = BoundedQueue::new(4);
        let stats = PipelineStats::default();
        assert_eq!(handle_delivery("q", b"{oops", &queue, &stats), Intake::Malformed);
        assert_eq!(handle_delivery("q", &body("a", "ok"), &queue, &stats), Intake::Enqueued);
        assert_eq!(stats.snapshot().decode_failures, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn catch_all_worker_receives_every_service() {
        let broker = MemoryBroker::new();
        let settings = BrokerSettings::new("amqp://memory");
        let manager = Arc::new(ConnectionManager::consumer(
            Arc::new(broker.clone()),
            &settings,
            None,
        ));
        let queue = Arc::new(BoundedQueue::new(16));
        let stats = Arc::new(PipelineStats::default());
        let shutdown = CancellationToken::new();
        let worker = ReceiveWorker::new(manager, settings.retry, Arc::clone(&queue), stats);
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        // Wait until the worker has declared the catch-all queue.
        while broker.queue_depth("all_logs").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let ch = broker
            .connect("amqp://memory", &ConnectOptions::default())
            .await
            .unwrap();
        ch.publish(DEFAULT_EXCHANGE, "billing.info", body("billing", "b"), props())
            .await
            .unwrap();
        ch.publish(DEFAULT_EXCHANGE, "auth.critical", body("auth", "a"), props())
            .await
            .unwrap();

        let first = queue.pop_timeout(Duration::from_secs(1)).await.unwrap();
        let second = queue.pop_timeout(Duration::from_secs(1)).await.unwrap();
        let mut services = vec![first.service().to_string(), second.service().to_string()];
        services.sort();
        assert_eq!(services, ["auth", "billing"]);

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn lost_connection_ends_worker_with_error() {
        let broker = MemoryBroker::new();
        let settings = BrokerSettings::new("amqp://memory");
        let manager = Arc::new(ConnectionManager::consumer(
            Arc::new(broker.clone()),
            &settings,
            Some("auth"),
        ));
        let worker = ReceiveWorker::new(
            manager,
            settings.retry,
            Arc::new(BoundedQueue::new(4)),
            Arc::new(PipelineStats::default()),
        );
        let handle = tokio::spawn(worker.run(CancellationToken::new()));
        while broker.open_connections() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        broker.kill_connections();
        assert!(matches!(
            handle.await.unwrap(),
            Err(PipelineError::StreamEnded(_))
        ));
    }
}
