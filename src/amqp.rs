//! RabbitMQ adapter built on `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, BrokerChannel, ConnectOptions, Delivery, DeliveryStream, MessageProperties};
use crate::error::BrokerError;
use crate::topology::{ExchangeKind, ExchangeSpec, QueueSpec};

const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        AmqpBroker
    }
}

fn is_precondition_failed(e: &lapin::Error) -> bool {
    matches!(
        e,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

fn declare_error(entity: String, e: lapin::Error) -> BrokerError {
    if is_precondition_failed(&e) {
        BrokerError::TopologyConflict {
            entity,
            reason: e.to_string(),
        }
    } else {
        BrokerError::Connection(e.to_string())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut uri: AMQPUri = url.parse().map_err(BrokerError::Connection)?;
        uri.query.heartbeat = Some(options.heartbeat.as_secs().min(u16::MAX as u64) as u16);

        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            publish_timeout: options.blocked_connection_timeout,
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    /// A blocked connection stalls publisher confirms; give up after this.
    publish_timeout: Duration,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        let kind = match exchange.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        self.channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(format!("exchange {}", exchange.name), e))
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        let mut args = FieldTable::default();
        let ttl_ms = queue.args.message_ttl.as_millis().min(u32::MAX as u128) as u32;
        args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl_ms));
        args.insert("x-max-length".into(), AMQPValue::LongUInt(queue.args.max_length));

        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..QueueDeclareOptions::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| declare_error(format!("queue {}", queue.name), e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(format!("binding {queue} <- {routing_key}"), e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        let mut props = BasicProperties::default()
            .with_content_type(properties.content_type.as_str().into())
            .with_timestamp(properties.timestamp);
        if properties.persistent {
            props = props.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        let publish = async {
            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    props,
                )
                .await?
                .await
        };
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(_confirm)) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::Publish(e.to_string())),
            Err(_) => Err(BrokerError::Publish(format!(
                "no confirmation within {:?}, connection may be blocked",
                self.publish_timeout
            ))),
        }
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(AmqpDeliveryStream {
            queue: queue.to_string(),
            consumer,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpDeliveryStream {
    queue: String,
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|d| {
                let properties = MessageProperties {
                    persistent: *d.properties.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
                    content_type: d
                        .properties
                        .content_type()
                        .as_ref()
                        .map(|c| c.as_str().to_string())
                        .unwrap_or_default(),
                    timestamp: d.properties.timestamp().unwrap_or_default(),
                };
                Delivery {
                    routing_key: d.routing_key.as_str().to_string(),
                    body: d.data,
                    properties,
                }
            })
            .map_err(|e| BrokerError::Consume {
                queue: self.queue.clone(),
                reason: e.to_string(),
            }),
        )
    }
}
