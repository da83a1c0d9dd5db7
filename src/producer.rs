use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerChannel, MessageProperties};
use crate::config::ProducerSettings;
use crate::connection::ConnectionManager;
use crate::error::{PublishError, RecordError};
use crate::record::{Level, LogRecord, MetaValue, Metadata};
use crate::retry::RetryPolicy;
use crate::topology::{routing_key, CONTENT_TYPE_JSON};

type ChannelSnapshot = Option<Arc<dyn BrokerChannel>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Reconnect,
}

/// Best-effort log publisher used by instrumented services.
///
/// The broker connection is owned by a background health monitor task. It
/// hands the current channel to `log()` through a `watch` channel, and
/// `log()` asks it to reconnect through a command channel; `log()` never
/// touches the connection itself. Publishing is at-most-once: when no
/// channel is available the record is dropped and counted, and no error
/// ever reaches the caller.
pub struct LoggerClient {
    service: String,
    exchange: String,
    channel: watch::Receiver<ChannelSnapshot>,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    published: AtomicU64,
    failed: AtomicU64,
}

impl LoggerClient {
    /// Connect (through the retry policy) and start the health monitor.
    ///
    /// The monitor is started whether or not the initial connection
    /// succeeded. Must be called from within a Tokio runtime.
    ///
    /// **Returns**
    /// - `Err(RecordError::EmptyService)` if `service_name` is blank.
    pub async fn new(
        service_name: impl Into<String>,
        broker: Arc<dyn Broker>,
        settings: ProducerSettings,
    ) -> Result<Self, RecordError> {
        let service = service_name.into();
        if service.trim().is_empty() {
            return Err(RecordError::EmptyService);
        }

        let manager = ConnectionManager::producer(broker, &settings.broker);
        let retry = settings.broker.retry;
        let initial = match retry.run("producer connect", |_| manager.connect()).await {
            Ok(channel) => {
                tracing::info!(service = %service, "logger connected");
                Some(channel)
            }
            Err(e) => {
                tracing::warn!(
                    service = %service,
                    error = %e.source_ref(),
                    "logger starting disconnected, health monitor will keep retrying"
                );
                None
            }
        };

        let (channel_tx, channel_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let monitor = HealthMonitor {
            manager,
            retry,
            interval: settings.health_interval,
            channel: channel_tx,
            commands: command_rx,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(monitor.run());

        Ok(LoggerClient {
            service,
            exchange: settings.broker.exchange,
            channel: channel_rx,
            commands: command_tx,
            shutdown,
            monitor: Mutex::new(Some(handle)),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_connected(&self) -> bool {
        self.current_channel().is_some()
    }

    /// Records handed to the broker.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// `log()` calls that did not reach the broker.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Publish a log record. `level` is case-insensitive.
    ///
    /// Never fails and never waits for a reconnect.
    pub async fn log(&self, level: &str, message: impl Into<String>, metadata: Option<Metadata>) {
        let result = match level.parse::<Level>() {
            Ok(level) => self.try_publish(level, message.into(), metadata).await,
            Err(_) => Err(PublishError::InvalidLevel(level.to_string())),
        };
        self.report(result);
    }

    pub async fn log_level(&self, level: Level, message: impl Into<String>, metadata: Option<Metadata>) {
        let result = self.try_publish(level, message.into(), metadata).await;
        self.report(result);
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log_level(Level::Info, message, None).await
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.log_level(Level::Warning, message, None).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log_level(Level::Error, message, None).await
    }

    pub async fn critical(&self, message: impl Into<String>) {
        self.log_level(Level::Critical, message, None).await
    }

    /// Run `f`, log its outcome under `name` and return its result as is.
    pub async fn log_fn<T, E, F>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Display,
    {
        let result = f();
        match &result {
            Ok(_) => {
                self.log_level(Level::Info, format!("Function {name} executed successfully"), None)
                    .await
            }
            Err(e) => {
                let mut metadata = Metadata::new();
                metadata.insert("error".to_string(), MetaValue::String(e.to_string()));
                self.log_level(Level::Error, format!("Function {name} failed"), Some(metadata))
                    .await
            }
        }
        result
    }

    /// Stop the health monitor and close the connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                tracing::warn!(service = %self.service, "health monitor did not stop in time");
            }
        }
    }

    async fn try_publish(
        &self,
        level: Level,
        message: String,
        metadata: Option<Metadata>,
    ) -> Result<(), PublishError> {
        let Some(channel) = self.current_channel() else {
            self.request_reconnect();
            return Err(PublishError::NotConnected);
        };

        let record = LogRecord::new(self.service.as_str(), level, message, metadata)?;
        let body = record.to_body()?;
        let properties = MessageProperties {
            persistent: true,
            content_type: CONTENT_TYPE_JSON.to_string(),
            timestamp: record.timestamp().timestamp().max(0) as u64,
        };
        let key = routing_key(&self.service, level);

        if let Err(e) = channel.publish(&self.exchange, &key, body, properties).await {
            self.request_reconnect();
            return Err(e.into());
        }
        tracing::trace!(routing_key = %key, "log published");
        Ok(())
    }

    fn report(&self, result: Result<(), PublishError>) {
        match result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(service = %self.service, error = %e, "log not published");
            }
        }
    }

    fn current_channel(&self) -> ChannelSnapshot {
        let channel = self.channel.borrow().clone();
        channel.filter(|c| c.is_open())
    }

    fn request_reconnect(&self) {
        // A full command buffer means a reconnect is already pending.
        let _ = self.commands.try_send(Command::Reconnect);
    }
}

impl Drop for LoggerClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Sole owner of the producer's broker connection.
struct HealthMonitor {
    manager: ConnectionManager,
    retry: RetryPolicy,
    interval: Duration,
    channel: watch::Sender<ChannelSnapshot>,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.interval) => {}
                Some(Command::Reconnect) = self.commands.recv() => {
                    tracing::debug!("reconnect requested by publisher");
                }
            }

            if self.manager.is_healthy() {
                continue;
            }

            self.channel.send_replace(None);
            let manager = &self.manager;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.retry.run("producer reconnect", |_| manager.connect()) => match result {
                    Ok(channel) => {
                        tracing::info!("logger reconnected");
                        self.channel.send_replace(Some(channel));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e.source_ref(), "logger reconnect failed");
                    }
                }
            }
        }

        self.channel.send_replace(None);
        self.manager.close().await;
        tracing::debug!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectOptions;
    use crate::config::BrokerSettings;
    use crate::memory::MemoryBroker;
    use crate::topology::{QueueArgs, QueueSpec, DEFAULT_EXCHANGE};

    fn settings() -> ProducerSettings {
        let broker = BrokerSettings::new("amqp://memory")
            .with_retry(RetryPolicy::new(2, Duration::from_millis(10)));
        ProducerSettings {
            broker,
            health_interval: Duration::from_millis(100),
        }
    }

    async fn bind_queue(broker: &MemoryBroker, queue: &str, key: &str) -> Arc<dyn BrokerChannel> {
        let ch = broker
            .connect("amqp://memory", &ConnectOptions::default())
            .await
            .unwrap();
        ch.declare_queue(&QueueSpec {
            name: queue.into(),
            durable: true,
            args: QueueArgs::default(),
        })
        .await
        .unwrap();
        ch.bind_queue(queue, DEFAULT_EXCHANGE, key).await.unwrap();
        ch
    }

    #[tokio::test]
    async fn publishes_with_routing_key_and_persistent_properties() {
        let broker = MemoryBroker::new();
        let client = LoggerClient::new("billing", Arc::new(broker.clone()), settings())
            .await
            .unwrap();
        let ch = bind_queue(&broker, "billing_warning_logs", "billing.warning").await;

        let mut metadata = Metadata::new();
        metadata.insert("user_count".into(), 2i64.into());
        client.log("Warning", "users listed", Some(metadata)).await;

        let mut stream = ch.consume("billing_warning_logs").await.unwrap();
        let delivery = stream.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.routing_key, "billing.warning");
        assert!(delivery.properties.persistent);
        assert_eq!(delivery.properties.content_type, "application/json");

        let record = LogRecord::from_body(&delivery.body).unwrap();
        assert_eq!(record.service(), "billing");
        assert_eq!(record.level(), Level::Warning);
        assert_eq!(record.message(), "users listed");
        assert_eq!(delivery.properties.timestamp, record.timestamp().timestamp() as u64);
        assert_eq!(client.published(), 1);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_log_is_a_noop_until_monitor_reconnects() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let client = LoggerClient::new("auth", Arc::new(broker.clone()), settings())
            .await
            .unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert!(!client.is_connected());

        client.log("ERROR", "lost", None).await;
        assert_eq!(broker.published(), 0);
        assert_eq!(client.failed(), 1);

        broker.set_available(true);
        sleep(Duration::from_millis(500)).await;
        assert!(client.is_connected());

        client.log("error", "delivered", None).await;
        assert_eq!(broker.published(), 1);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_is_replaced() {
        let broker = MemoryBroker::new();
        let client = LoggerClient::new("auth", Arc::new(broker.clone()), settings())
            .await
            .unwrap();
        broker.kill_connections();
        client.info("while down").await;
        assert_eq!(client.failed(), 1);

        sleep(Duration::from_millis(500)).await;
        client.info("after reconnect").await;
        assert_eq!(broker.published(), 1);
        assert_eq!(broker.open_connections(), 1);
        client.close().await;
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn unknown_level_is_not_published() {
        let broker = MemoryBroker::new();
        let client = LoggerClient::new("auth", Arc::new(broker.clone()), settings())
            .await
            .unwrap();
        client.log("debug", "nope", None).await;
        assert_eq!(broker.published(), 0);
        assert_eq!(client.failed(), 1);
    }

    #[tokio::test]
    async fn empty_service_is_rejected() {
        let broker = MemoryBroker::new();
        assert!(LoggerClient::new("", Arc::new(broker), settings()).await.is_err());
    }

    #[tokio::test]
    async fn log_fn_reports_outcome_and_passes_result_through() {
        let broker = MemoryBroker::new();
        let client = LoggerClient::new("jobs", Arc::new(broker.clone()), settings())
            .await
            .unwrap();
        let ch = bind_queue(&broker, "jobs_all", "#").await;

        let ok: Result<u32, String> = client.log_fn("compute", || Ok(7)).await;
        assert_eq!(ok, Ok(7));
        let err: Result<u32, String> = client.log_fn("compute", || Err("boom".to_string())).await;
        assert_eq!(err, Err("boom".to_string()));

        let mut stream = ch.consume("jobs_all").await.unwrap();
        let first = LogRecord::from_body(&stream.next_delivery().await.unwrap().unwrap().body).unwrap();
        assert_eq!(first.message(), "Function compute executed successfully");
        let second = LogRecord::from_body(&stream.next_delivery().await.unwrap().unwrap().body).unwrap();
        assert_eq!(second.level(), Level::Error);
        assert_eq!(second.metadata().get("error"), Some(&MetaValue::String("boom".into())));
    }
}
