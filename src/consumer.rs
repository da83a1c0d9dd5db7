use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::ConsumerSettings;
use crate::connection::ConnectionManager;
use crate::error::PipelineError;
use crate::processor::BatchProcessor;
use crate::queue::BoundedQueue;
use crate::receiver::ReceiveWorker;
use crate::record::LogRecord;
use crate::sink::LogSink;
use crate::stats::{PipelineStats, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Consumer pipeline supervisor.
///
/// Owns the broker connection, the internal queue, the stop signal and
/// the handles of the receive worker and batch processor tasks. `stop()`
/// is the single release point for the connection.
pub struct Consumer {
    settings: ConsumerSettings,
    manager: Arc<ConnectionManager>,
    sink: Arc<dyn LogSink>,
    queue: Arc<BoundedQueue<LogRecord>>,
    stats: Arc<PipelineStats>,
    state: PipelineState,
    shutdown: CancellationToken,
    receiver: Option<JoinHandle<Result<(), PipelineError>>>,
    processors: Vec<JoinHandle<()>>,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, sink: Arc<dyn LogSink>, settings: ConsumerSettings) -> Self {
        let manager = ConnectionManager::consumer(
            broker,
            &settings.broker,
            settings.service_filter.as_deref(),
        );
        Consumer {
            manager: Arc::new(manager),
            sink,
            queue: Arc::new(BoundedQueue::new(settings.queue_capacity)),
            stats: Arc::new(PipelineStats::default()),
            state: PipelineState::Stopped,
            shutdown: CancellationToken::new(),
            receiver: None,
            processors: Vec::new(),
            settings,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records waiting in the internal queue.
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Launch the receive worker and the batch processors. Must be called
    /// from within a Tokio runtime.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Stopped {
            return Err(PipelineError::InvalidState(self.state));
        }
        self.state = PipelineState::Starting;
        self.shutdown = CancellationToken::new();

        let worker = ReceiveWorker::new(
            Arc::clone(&self.manager),
            self.settings.broker.retry,
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
        );
        self.receiver = Some(tokio::spawn(worker.run(self.shutdown.clone())));

        for id in 0..self.settings.processor_workers.max(1) {
            let processor = BatchProcessor::new(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&self.sink),
                Arc::clone(&self.stats),
                self.settings.batch_size,
                self.settings.batch_timeout,
            );
            self.processors
                .push(tokio::spawn(processor.run(self.shutdown.clone())));
        }

        self.state = PipelineState::Running;
        tracing::info!(
            service_filter = self.settings.service_filter.as_deref().unwrap_or("*"),
            workers = self.processors.len(),
            batch_size = self.settings.batch_size,
            capacity = self.queue.capacity(),
            "consumer pipeline started"
        );
        Ok(())
    }

    /// Signal every task to stop, join each one for at most the configured
    /// join timeout, then close the connection. Tasks that do not finish in
    /// time are abandoned. Calling `stop` on a stopped pipeline does nothing.
    pub async fn stop(&mut self) {
        if matches!(self.state, PipelineState::Stopped | PipelineState::Stopping) {
            return;
        }
        self.state = PipelineState::Stopping;
        self.shutdown.cancel();

        let join_timeout = self.settings.join_timeout;
        if let Some(handle) = self.receiver.take() {
            match timeout(join_timeout, handle).await {
                Ok(Ok(Err(e))) => tracing::debug!(error = %e, "receive worker had failed before stop"),
                Ok(Err(e)) => tracing::warn!(error = %e, "receive worker panicked"),
                Ok(Ok(Ok(()))) => {}
                Err(_) => tracing::warn!(?join_timeout, "abandoning receive worker"),
            }
        }
        for handle in self.processors.drain(..) {
            join_bounded("batch processor", handle, join_timeout).await;
        }

        self.manager.close().await;
        self.state = PipelineState::Stopped;
        tracing::info!(
            stats = ?self.stats.snapshot(),
            abandoned = self.backlog(),
            "consumer pipeline stopped"
        );
    }

    /// Start the pipeline and supervise it until `shutdown` fires or the
    /// receive worker fails. The pipeline is stopped either way.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        self.start()?;
        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            result = self.wait_receiver() => result,
        };
        self.stop().await;
        result
    }

    async fn wait_receiver(&mut self) -> Result<(), PipelineError> {
        let Some(handle) = self.receiver.as_mut() else {
            return std::future::pending().await;
        };
        let joined = handle.await;
        self.receiver = None;
        joined?
    }
}

async fn join_bounded(what: &str, handle: JoinHandle<()>, join_timeout: Duration) {
    match timeout(join_timeout, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(task = what, error = %e, "task panicked"),
        Err(_) => tracing::warn!(task = what, ?join_timeout, "abandoning task"),
    }
}

/// Outermost supervision loop.
///
/// Builds a fresh [`Consumer`] (new connection, new internal queue, new
/// tasks) and runs it. When it fails, waits `restart_delay` and builds
/// another one from scratch. Returns `Ok(())` once `shutdown` fires, or the
/// error of a pipeline that failed on a configuration problem, which a
/// rebuild cannot fix.
pub async fn run_forever(
    broker: Arc<dyn Broker>,
    sink: Arc<dyn LogSink>,
    settings: ConsumerSettings,
    shutdown: CancellationToken,
) -> Result<(), PipelineError> {
    let mut incarnation: u64 = 0;
    loop {
        incarnation += 1;
        let consumer = Consumer::new(Arc::clone(&broker), Arc::clone(&sink), settings.clone());
        match consumer.run(shutdown.child_token()).await {
            Ok(()) if shutdown.is_cancelled() => return Ok(()),
            Ok(()) => tracing::warn!(incarnation, "consumer pipeline exited unexpectedly"),
            Err(e) if e.is_fatal() => {
                tracing::error!(incarnation, error = %e, "consumer pipeline failed permanently");
                return Err(e);
            }
            Err(e) => tracing::error!(
                incarnation,
                error = %e,
                delay = ?settings.restart_delay,
                "consumer pipeline failed, rebuilding"
            ),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = sleep(settings.restart_delay) => {}
        }
    }
}
