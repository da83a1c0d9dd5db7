use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BrokerError;
use crate::topology::{ExchangeSpec, QueueSpec};

/// Connection tuning passed to [`Broker::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub heartbeat: Duration,
    pub blocked_connection_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            heartbeat: Duration::from_secs(600),
            blocked_connection_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub content_type: String,
    /// Publish time in epoch seconds.
    pub timestamp: u64,
}

/// A message handed to a consumer. Deliveries are acknowledged by the
/// broker as soon as they are dequeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Entry point to an AMQP-style broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection and a channel on it.
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

/// One connection/channel pair. Declarations are idempotent when the
/// parameters match and fail with [`BrokerError::TopologyConflict`] when
/// they do not.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// True only while both the connection and the channel are open.
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Start an auto-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Close the connection. Closing an already-closed channel is a no-op.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Stream of deliveries from one queue.
#[async_trait]
pub trait DeliveryStream: Send {
    /// `None` once the underlying channel is gone.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;
}
