//! AMQP transport (RabbitMQ) via `lapin`.
//!
//! Topology, declared idempotently by both sides: a durable direct exchange,
//! a durable queue, and a binding on the configured routing key.
//!
//! The publisher shares one connection and channel behind a mutex. The
//! consumer owns its own connection, sets prefetch to one and acknowledges
//! manually, so a worker never holds more than one unsettled message.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Disposition, MessageHandler, MessagePublisher};
use crate::config::BrokerConfig;
use crate::error::IngestError;
use crate::models::ProcessingMessage;

const PERSISTENT: u8 = 2;
const CONSUMER_TAG: &str = "catalog-ingest-worker";

async fn declare_topology(channel: &Channel, broker: &BrokerConfig) -> lapin::Result<()> {
    channel
        .exchange_declare(
            &broker.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(
            &broker.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &broker.queue,
            &broker.exchange,
            &broker.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

async fn open(broker: &BrokerConfig) -> lapin::Result<(Connection, Channel)> {
    let connection = Connection::connect(&broker.amqp_uri(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    declare_topology(&channel, broker).await?;
    Ok((connection, channel))
}

enum PublisherState {
    Disconnected,
    Connected {
        connection: Connection,
        channel: Channel,
    },
}

impl PublisherState {
    fn is_open(&self) -> bool {
        match self {
            PublisherState::Disconnected => false,
            PublisherState::Connected {
                connection,
                channel,
            } => connection.status().connected() && channel.status().connected(),
        }
    }
}

/// Publishes processing messages over one shared, lazily opened channel.
pub struct AmqpPublisher {
    broker: BrokerConfig,
    state: Mutex<PublisherState>,
}

impl AmqpPublisher {
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            state: Mutex::new(PublisherState::Disconnected),
        }
    }

    /// Opens the connection up front so `/health` reflects the broker from
    /// the start. Failure is logged; the next publish retries.
    pub async fn warm_up(&self) {
        let mut state = self.state.lock().await;
        if let Err(err) = self.ensure_connected(&mut state).await {
            tracing::warn!(error = %err, host = %self.broker.host, "broker not reachable yet");
        }
    }

    /// Single entry point for (re)establishing the channel. Reinitializes
    /// when the state is disconnected or the channel has closed.
    async fn ensure_connected(&self, state: &mut PublisherState) -> lapin::Result<Channel> {
        if let PublisherState::Connected {
            connection,
            channel,
        } = state
        {
            if connection.status().connected() && channel.status().connected() {
                return Ok(channel.clone());
            }
            let _ = connection.close(200, "reconnecting").await;
        }
        *state = PublisherState::Disconnected;

        let (connection, channel) = open(&self.broker).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        tracing::info!(
            host = %self.broker.host,
            exchange = %self.broker.exchange,
            "publisher connected"
        );
        *state = PublisherState::Connected {
            connection,
            channel: channel.clone(),
        };
        Ok(channel)
    }

    async fn send(&self, channel: &Channel, message: &ProcessingMessage) -> Result<(), String> {
        let payload = serde_json::to_vec(message).map_err(|e| e.to_string())?;
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".to_string().into())
            .with_message_id(uuid::Uuid::new_v4().to_string().into())
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);

        let confirmation = channel
            .basic_publish(
                &self.broker.exchange,
                &self.broker.routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| e.to_string())?
            .await
            .map_err(|e| e.to_string())?;

        if confirmation.is_nack() {
            return Err("broker did not confirm the message".to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for AmqpPublisher {
    async fn publish(&self, message: &ProcessingMessage) -> Result<(), IngestError> {
        let mut state = self.state.lock().await;
        let channel = self
            .ensure_connected(&mut state)
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;

        let outcome = self.send(&channel, message).await;
        match outcome {
            Ok(()) => {
                tracing::info!(job_id = %message.job_id, queue = %self.broker.queue, "message published");
                Ok(())
            }
            Err(err) => {
                // Force a reconnect on the next publish.
                *state = PublisherState::Disconnected;
                tracing::error!(job_id = %message.job_id, error = %err, "publish failed");
                Err(IngestError::Transport(err))
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        self.state.lock().await.is_open()
    }
}

/// Long-running consumer that feeds deliveries to a [`MessageHandler`].
pub struct AmqpConsumer {
    broker: BrokerConfig,
    handler: Arc<MessageHandler>,
}

impl AmqpConsumer {
    pub fn new(broker: BrokerConfig, handler: Arc<MessageHandler>) -> Self {
        Self { broker, handler }
    }

    /// Consumes until `cancel` fires, reconnecting after a fixed interval
    /// whenever the connection or the consumer stream ends.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.broker.reconnect_interval();
        while !cancel.is_cancelled() {
            match self.consume(&cancel).await {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => tracing::warn!("consumer stream ended"),
                Err(err) => tracing::error!(error = %err, host = %self.broker.host, "broker connection failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            tracing::info!("reconnecting consumer");
        }
        tracing::info!("consumer stopped");
    }

    async fn consume(&self, cancel: &CancellationToken) -> lapin::Result<()> {
        let (connection, channel) = open(&self.broker).await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        let mut deliveries = channel
            .basic_consume(
                &self.broker.queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue = %self.broker.queue, "consuming");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };
            let Some(delivery) = next else {
                break;
            };
            let delivery = delivery?;

            match self.handler.handle(&delivery.data).await {
                Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await?,
                Disposition::Reject => {
                    delivery
                        .acker
                        .reject(BasicRejectOptions { requeue: false })
                        .await?
                }
            }
        }

        let _ = channel.close(200, "consumer stopping").await;
        let _ = connection.close(200, "consumer stopping").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Job;

    fn unreachable_broker() -> BrokerConfig {
        let mut broker = crate::config::Config::minimal().broker;
        broker.host = "127.0.0.1".to_string();
        broker.port = 1;
        broker
    }

    #[tokio::test]
    async fn fresh_publisher_is_unhealthy() {
        let publisher = AmqpPublisher::new(unreachable_broker());
        assert!(!publisher.is_healthy().await);
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_transport_error() {
        let publisher = AmqpPublisher::new(unreachable_broker());
        let job = Job::new_queued("a.csv", 10, None);
        let message = ProcessingMessage::for_job(&job, "Id\n1".to_string());

        let err = publisher.publish(&message).await.unwrap_err();
        assert!(matches!(err, IngestError::Transport(_)));
        assert!(!publisher.is_healthy().await);
    }

    #[tokio::test]
    async fn consumer_stops_on_cancel_while_broker_is_down() {
        use crate::store::InMemoryStore;

        let store = Arc::new(InMemoryStore::new());
        let handler = Arc::new(MessageHandler::new(
            store.clone(),
            store,
            crate::config::Config::minimal().processing,
        ));
        let consumer = AmqpConsumer::new(unreachable_broker(), handler);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .expect("consumer did not stop")
            .unwrap();
    }
}
