//! RabbitMQ plumbing: the order-ready consumer and the dispatch event sink.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::AmqpConfig;
use crate::engine::queue::{parse_order_id, OrderQueue};
use crate::error::AppError;
use crate::messaging::events::EventSink;
use crate::models::event::DispatchEvent;

const CONSUMER_TAG: &str = "courier-dispatch";

/// Connects with a fixed backoff, giving up after `connect_attempts` tries.
pub async fn connect_with_retry(config: &AmqpConfig) -> Result<Connection, AppError> {
    let attempts = config.connect_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        info!(attempt, attempts, "connecting to broker");
        match Connection::connect(&config.url, ConnectionProperties::default()).await {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                last_error = err.to_string();
                if attempt < attempts {
                    warn!(error = %err, backoff_secs = config.connect_backoff.as_secs(), "broker connection failed; retrying");
                    sleep(config.connect_backoff).await;
                }
            }
        }
    }

    Err(AppError::Messaging(format!(
        "broker unreachable after {attempts} attempts: {last_error}"
    )))
}

async fn open_channel(connection: &Connection, queue: &str) -> Result<Channel, AppError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|err| AppError::Messaging(format!("failed to create channel: {err}")))?;

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| AppError::Messaging(format!("failed to declare queue {queue}: {err}")))?;

    Ok(channel)
}

/// Feeds order-ready ids from the broker into the in-process order queue.
pub struct OrderConsumer {
    config: AmqpConfig,
    connection: Connection,
}

impl OrderConsumer {
    /// Startup connection; failing here is fatal to the process.
    pub async fn connect(config: AmqpConfig) -> Result<Self, AppError> {
        let connection = connect_with_retry(&config).await?;
        Ok(Self { config, connection })
    }

    /// Consumes forever, reconnecting whenever the connection or the consumer
    /// stream goes away.
    pub async fn run(mut self, queue: OrderQueue) {
        loop {
            match self.consume(&queue).await {
                Ok(()) => warn!("order consumer stream ended; reconnecting"),
                Err(AppError::Internal(msg)) => {
                    error!(error = %msg, "order queue closed; stopping consumer");
                    return;
                }
                Err(err) => error!(error = %err, "order consumer failed; reconnecting"),
            }

            self.connection = self.reconnect().await;
        }
    }

    async fn reconnect(&self) -> Connection {
        loop {
            sleep(self.config.connect_backoff).await;
            match Connection::connect(&self.config.url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    info!("reconnected to broker");
                    return connection;
                }
                Err(err) => warn!(error = %err, "broker reconnect failed"),
            }
        }
    }

    async fn consume(&self, queue: &OrderQueue) -> Result<(), AppError> {
        let channel = open_channel(&self.connection, &self.config.order_queue).await?;
        let mut consumer = channel
            .basic_consume(
                &self.config.order_queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| AppError::Messaging(format!("failed to start consumer: {err}")))?;

        info!(queue = %self.config.order_queue, "consuming order-ready events");

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery
                .map_err(|err| AppError::Messaging(format!("delivery failed: {err}")))?;

            match parse_order_id(&delivery.data) {
                Some(order_id) => {
                    if let Err(err) = queue.enqueue(&order_id).await {
                        let requeue = BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        };
                        if let Err(nack_err) = delivery.nack(requeue).await {
                            error!(error = %nack_err, "failed to nack order-ready event");
                        }
                        return Err(err);
                    }
                    debug!(order_id = %order_id, "order-ready event accepted");
                }
                None => warn!(
                    payload = %String::from_utf8_lossy(&delivery.data),
                    "dropping unparsable order-ready event"
                ),
            }

            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %err, "failed to ack order-ready event");
            }
        }

        Ok(())
    }
}

/// Publishes dispatch events as persistent JSON messages.
pub struct AmqpEventSink {
    config: AmqpConfig,
    link: Mutex<Option<(Connection, Channel)>>,
}

impl AmqpEventSink {
    pub async fn connect(config: AmqpConfig) -> Result<Self, AppError> {
        let connection = connect_with_retry(&config).await?;
        let channel = open_channel(&connection, &config.event_queue).await?;
        Ok(Self {
            config,
            link: Mutex::new(Some((connection, channel))),
        })
    }
}

#[async_trait]
impl EventSink for AmqpEventSink {
    async fn publish(&self, event: &DispatchEvent) -> Result<(), AppError> {
        let payload = serde_json::to_vec(event)
            .map_err(|err| AppError::Internal(format!("failed to encode event: {err}")))?;

        let mut link = self.link.lock().await;
        let channel = match link.as_ref() {
            Some((_, channel)) => channel.clone(),
            None => {
                let connection =
                    Connection::connect(&self.config.url, ConnectionProperties::default())
                        .await
                        .map_err(|err| AppError::Messaging(format!("reconnect failed: {err}")))?;
                let channel = open_channel(&connection, &self.config.event_queue).await?;
                *link = Some((connection, channel.clone()));
                channel
            }
        };

        let published = channel
            .basic_publish(
                "",
                &self.config.event_queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await;

        let result = match published {
            Ok(confirm) => confirm.await.map(|_| ()),
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            // drop the link so the next event reconnects
            *link = None;
            return Err(AppError::Messaging(format!("failed to publish event: {err}")));
        }

        Ok(())
    }
}
