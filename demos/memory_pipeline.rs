use std::sync::Arc;

use async_trait::async_trait;
use loghive::broker::Broker;
use loghive::config::{BrokerSettings, ConsumerSettings, ProducerSettings};
use loghive::error::SinkError;
use loghive::init::init_tracing;
use loghive::memory::MemoryBroker;
use loghive::{Consumer, LogRecord, LogSink, LoggerClient, Metadata};
use tokio::time::{sleep, Duration};

/// Example of plugging in custom storage by implementing `LogSink`
/// directly. Here records are just printed.
struct StdoutSink;

#[async_trait]
impl LogSink for StdoutSink {
    async fn persist(&self, record: &LogRecord) -> Result<(), SinkError> {
        println!(
            "[{}] {} {}: {} {:?}",
            record.timestamp(),
            record.service(),
            record.level(),
            record.message(),
            record.metadata()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let settings = BrokerSettings::new("amqp://in-memory");

    // Start the consumer first so the catch-all queue exists before
    // anything is published.
    let mut consumer = Consumer::new(
        Arc::clone(&broker),
        Arc::new(StdoutSink),
        ConsumerSettings::new(settings.clone()).batch_size(10),
    );
    consumer.start()?;
    sleep(Duration::from_millis(100)).await;

    let logger = LoggerClient::new("flask_service", broker, ProducerSettings::new(settings)).await?;
    logger.info("Home page accessed").await;

    let mut metadata = Metadata::new();
    metadata.insert("user_count".into(), 0i64.into());
    logger.log("warning", "Users retrieved successfully", Some(metadata)).await;

    let _ = logger
        .log_fn("create_user", || Err::<(), _>("duplicate email"))
        .await;

    // Partial batches are flushed after the one second collection timeout.
    sleep(Duration::from_millis(1500)).await;
    consumer.stop().await;
    logger.close().await;
    println!("stats: {:?}", consumer.stats());
    Ok(())
}
