use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use loghive::config::{BrokerSettings, ConsumerSettings, ProducerSettings};
use loghive::memory::MemoryBroker;
use loghive::noop_sink::NoopSink;
use loghive::{Consumer, LoggerClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(MemoryBroker::new());
    let settings = BrokerSettings::new("amqp://in-memory");

    // A small internal queue makes backpressure drops visible.
    let mut consumer = Consumer::new(
        broker.clone(),
        Arc::new(NoopSink),
        ConsumerSettings::new(settings.clone())
            .queue_capacity(5_000)
            .batch_size(1_000)
            .processor_workers(2),
    );
    consumer.start()?;
    sleep(Duration::from_millis(100)).await;

    let logger = LoggerClient::new("load_service", broker.clone(), ProducerSettings::new(settings)).await?;

    let n: u64 = 100_000;
    let start = Instant::now();
    for i in 0..n {
        logger.error(format!("load test error {}", i)).await;
    }
    let elapsed = start.elapsed();
    println!(
        "published {} logs in {:?} (~{:.0} logs/s)",
        logger.published(),
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    // Give the processors a little time to drain the internal queue.
    sleep(Duration::from_secs(2)).await;
    consumer.stop().await;
    logger.close().await;

    let stats = consumer.stats();
    println!(
        "received={} persisted={} dropped={} batches={}",
        stats.received, stats.persisted, stats.dropped, stats.batches
    );
    Ok(())
}
