//! Drain shipped logs from the broker into storage.
use envconfig::Envconfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use loghive::backend::{make_sink_from_config, parse_dsn};
use loghive::broker::Broker;
use loghive::config::ConsumerConfig;
use loghive::init::{init_tracing_with_config, LoggingConfig};

#[cfg(feature = "amqp")]
fn broker() -> Option<Arc<dyn Broker>> {
    Some(Arc::new(loghive::amqp::AmqpBroker::new()))
}

#[cfg(not(feature = "amqp"))]
fn broker() -> Option<Arc<dyn Broker>> {
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConsumerConfig::init_from_env()?;
    init_tracing_with_config(LoggingConfig {
        enable_stdout: config.log_stdout,
        ..LoggingConfig::default()
    })?;

    let settings = config.settings()?;
    let sink = make_sink_from_config(&parse_dsn(&config.storage_dsn)?).await?;
    let Some(broker) = broker() else {
        return Err("built without the `amqp` feature, no broker client available".into());
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                on_signal.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    loghive::run_forever(broker, sink, settings, shutdown).await?;
    Ok(())
}
