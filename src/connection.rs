use std::sync::{Arc, Mutex, MutexGuard};

use crate::broker::{Broker, BrokerChannel, ConnectOptions};
use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::topology::{consumer_bindings, Binding, ExchangeSpec, QueueArgs};

/// Owns one broker connection/channel pair and the topology it needs.
///
/// Producers only declare the shared exchange. Consumers additionally
/// declare and bind their queues: the per-level queues of one service, or
/// the catch-all queue when no service filter is set.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    url: String,
    options: ConnectOptions,
    exchange: ExchangeSpec,
    bindings: Vec<Binding>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl ConnectionManager {
    pub fn producer(broker: Arc<dyn Broker>, settings: &BrokerSettings) -> Self {
        Self::with_bindings(broker, settings, Vec::new())
    }

    pub fn consumer(
        broker: Arc<dyn Broker>,
        settings: &BrokerSettings,
        service_filter: Option<&str>,
    ) -> Self {
        let bindings = consumer_bindings(service_filter, QueueArgs::default());
        Self::with_bindings(broker, settings, bindings)
    }

    fn with_bindings(
        broker: Arc<dyn Broker>,
        settings: &BrokerSettings,
        bindings: Vec<Binding>,
    ) -> Self {
        ConnectionManager {
            broker,
            url: settings.url.clone(),
            options: settings.connect_options(),
            exchange: ExchangeSpec::new(settings.exchange.clone(), settings.exchange_kind),
            bindings,
            channel: Mutex::new(None),
        }
    }

    /// Open a fresh connection and declare the topology on it.
    ///
    /// Any previous channel is closed first. On failure no channel is kept,
    /// so [`ConnectionManager::is_healthy`] stays false.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let stale = self.slot().take();
        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                tracing::debug!(error = %e, "closing stale channel failed");
            }
        }

        let channel = self.broker.connect(&self.url, &self.options).await?;
        if let Err(e) = self.declare_topology(channel.as_ref()).await {
            let _ = channel.close().await;
            return Err(e);
        }

        tracing::info!(
            exchange = %self.exchange.name,
            queues = self.bindings.len(),
            "connected to broker"
        );
        *self.slot() = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn declare_topology(&self, channel: &dyn BrokerChannel) -> Result<(), BrokerError> {
        channel.declare_exchange(&self.exchange).await?;
        for binding in self.unroutable_bindings() {
            tracing::warn!(
                exchange = %self.exchange.name,
                queue = %binding.queue.name,
                "`#` on a direct exchange is matched literally, this queue will stay empty on \
                 RabbitMQ; set LOGHIVE_EXCHANGE_KIND=topic"
            );
        }
        for binding in &self.bindings {
            channel.declare_queue(&binding.queue).await?;
            channel
                .bind_queue(&binding.queue.name, &self.exchange.name, &binding.routing_key)
                .await?;
            tracing::debug!(
                queue = %binding.queue.name,
                routing_key = %binding.routing_key,
                "queue bound"
            );
        }
        Ok(())
    }

    /// True only if a channel exists and both it and its connection are open.
    pub fn is_healthy(&self) -> bool {
        self.slot().as_ref().map(|c| c.is_open()).unwrap_or(false)
    }

    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.slot().clone()
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Bindings whose wildcard key the configured exchange kind cannot route.
    pub fn unroutable_bindings(&self) -> impl Iterator<Item = &Binding> {
        let kind = self.exchange.kind;
        self.bindings.iter().filter(move |b| b.is_literal_wildcard(kind))
    }

    /// Release the connection. Safe to call any number of times.
    pub async fn close(&self) {
        let channel = self.slot().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                tracing::warn!(error = %e, "error while closing broker connection");
            }
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn BrokerChannel>>> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner())
    }
}
