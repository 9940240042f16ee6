//! Queue broker abstraction and AMQP implementation
//!
//! Each subscription owns its own connection and channel, with a prefetch of
//! one so a consumer never holds more than one unsettled message.

use crate::types::{ConnectionParams, ConnectorDescriptor};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, ConfirmSelectOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{info, warn};

/// One message received from a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker delivery tag, scoped to the subscription
    pub tag: u64,
    /// Raw body
    pub body: Vec<u8>,
}

/// Opens subscriptions on queues
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Connect and start consuming the descriptor's queue
    async fn subscribe(&self, descriptor: &ConnectorDescriptor) -> Result<Box<dyn Subscription>>;
}

/// A live subscription on one queue
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery; `None` once the broker closed the stream
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    /// Acknowledge a delivery
    async fn ack(&mut self, tag: u64) -> Result<()>;

    /// Reject a delivery back to the queue
    async fn nack(&mut self, tag: u64) -> Result<()>;

    /// Release the connection
    async fn close(&mut self) -> Result<()>;
}

/// AMQP 0-9-1 broker
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    /// Create new broker
    pub fn new() -> Self {
        Self
    }
}

/// Build the AMQP URI for a queue's connection parameters
pub fn amqp_uri(params: &ConnectionParams) -> AMQPUri {
    AMQPUri {
        scheme: if params.use_ssl {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.user.clone(),
                password: params.pass.clone(),
            },
            host: params.host.clone(),
            port: params.port,
        },
        vhost: params.vhost.clone(),
        query: Default::default(),
    }
}

#[async_trait]
impl QueueBroker for AmqpBroker {
    async fn subscribe(&self, descriptor: &ConnectorDescriptor) -> Result<Box<dyn Subscription>> {
        let params = &descriptor.connection;
        info!(
            queue = %descriptor.queue_name,
            host = %params.host,
            port = params.port,
            ssl = params.use_ssl,
            "Connecting to broker"
        );

        let connection =
            Connection::connect_uri(amqp_uri(params), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        if let Err(e) = channel.confirm_select(ConfirmSelectOptions::default()).await {
            warn!(queue = %descriptor.queue_name, error = %e, "Unable to enable publisher confirms");
        }
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let consumer = channel
            .basic_consume(
                &descriptor.queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %descriptor.queue_name, "Subscribed to queue");

        Ok(Box::new(AmqpSubscription {
            queue_name: descriptor.queue_name.clone(),
            connection,
            channel,
            consumer,
        }))
    }
}

struct AmqpSubscription {
    queue_name: String,
    connection: Connection,
    channel: Channel,
    consumer: lapin::Consumer,
}

impl AmqpSubscription {
    fn channel_open(&self, action: &str, tag: u64) -> bool {
        if self.channel.status().connected() {
            return true;
        }
        info!(
            queue = %self.queue_name,
            tag,
            "Unable to {} message, channel is closed",
            action
        );
        false
    }
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| Delivery {
                tag: delivery.delivery_tag,
                body: delivery.data,
            })
            .map_err(Into::into),
        )
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        if self.channel_open("ack", tag) {
            self.channel
                .basic_ack(tag, BasicAckOptions::default())
                .await?;
        }
        Ok(())
    }

    async fn nack(&mut self, tag: u64) -> Result<()> {
        if self.channel_open("nack", tag) {
            self.channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "consumer stopped").await?;
        }
        Ok(())
    }
}
