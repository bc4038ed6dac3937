//! RabbitMQ-backed `Queue` implementation.
//!
//! Topology per message type (`birthday` / `anniversary`):
//!
//! - `messages.<type>` — the main queue, consumed with explicit ack and
//!   `global: false` prefetch.
//! - `messages.<type>.delay.<seconds>` — a ladder of TTL queues (1, 2, 4, 8,
//!   16, 32, 60s) that dead-letter back into the main queue once the TTL
//!   expires, implementing delayed delivery without a broker plugin.
//! - `messages.<type>.dlq` — terminal dead-letter queue once a message has
//!   exhausted [`MAX_RETRIES`].
//!
//! `nack` acks the original delivery, increments the job's retry count, and
//! republishes onto the delay rung matching the new count, rather than
//! relying on the broker's own dead-letter-on-reject behavior: that would
//! preserve the original routing key, which the retry exchange has no
//! binding for. Once a caller has exhausted its retry budget it calls
//! `nack_to_dlq` instead, which publishes straight to `{base}.dlq`.
//!
//! Reconnection is handled by `lapin`'s own heartbeat; on a dropped
//! connection callers are expected to recreate a `LapinQueue` behind a
//! bounded exponential backoff (see `kernel::service`).

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;

use crate::domain::message::MessageType;

use super::model::{QueueJob, MAX_MESSAGE_BYTES};
use super::{Delivery, DeliveryHandle, Queue};

const DELAY_RUNGS_SECS: [u64; 7] = [1, 2, 4, 8, 16, 32, 60];

pub struct LapinQueue {
    channel: Channel,
    // Each message type's consumer keeps its own lapin::Consumer stream so
    // `poll` can pull without racing other callers for the same channel.
    consumers: Mutex<std::collections::HashMap<&'static str, lapin::Consumer>>,
}

impl LapinQueue {
    pub async fn connect(amqp_url: &str, prefetch: u16) -> Result<Self> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .context("connecting to RabbitMQ")?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(prefetch, lapin::options::BasicQosOptions { global: false })
            .await?;

        for message_type in [MessageType::Birthday, MessageType::Anniversary] {
            Self::declare_topology(&channel, message_type).await?;
        }

        Ok(Self {
            channel,
            consumers: Mutex::new(std::collections::HashMap::new()),
        })
    }

    async fn declare_topology(channel: &Channel, message_type: MessageType) -> Result<()> {
        let base = message_type.queue_name();
        let exchange = format!("{base}.direct");
        let dlq = format!("{base}.dlq");

        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let mut main_args = FieldTable::default();
        main_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(format!("{base}.retry").into()),
        );
        channel
            .queue_declare(
                base,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                main_args,
            )
            .await?;
        channel
            .queue_bind(
                base,
                &exchange,
                base,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .exchange_declare(
                &format!("{base}.retry"),
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for seconds in DELAY_RUNGS_SECS {
            let delay_queue = format!("{base}.delay.{seconds}");
            let mut args = FieldTable::default();
            args.insert("x-message-ttl".into(), AMQPValue::LongUInt((seconds * 1000) as u32));
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.clone().into()),
            );
            args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(base.into()));

            channel
                .queue_declare(
                    &delay_queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    args,
                )
                .await?;
            channel
                .queue_bind(
                    &delay_queue,
                    &format!("{base}.retry"),
                    &delay_queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        channel
            .queue_declare(
                &dlq,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    fn delay_rung_for(delay: Duration) -> u64 {
        let secs = delay.as_secs();
        DELAY_RUNGS_SECS
            .iter()
            .copied()
            .find(|rung| *rung >= secs)
            .unwrap_or(*DELAY_RUNGS_SECS.last().unwrap())
    }
}

#[async_trait::async_trait]
impl Queue for LapinQueue {
    async fn publish(&self, job: QueueJob, delay: Duration) -> Result<()> {
        let payload = serde_json::to_vec(&job)?;
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(anyhow!(
                "queue payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_MESSAGE_BYTES
            ));
        }

        let base = job.message_type.queue_name();
        let (exchange, routing_key) = if delay.is_zero() {
            (format!("{base}.direct"), base.to_string())
        } else {
            let rung = Self::delay_rung_for(delay);
            (format!("{base}.retry"), format!("{base}.delay.{rung}"))
        };

        let confirm = self
            .channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?;
        confirm.await?;

        Ok(())
    }

    async fn poll(&self, message_type: MessageType) -> Result<Option<Delivery>> {
        let base = message_type.queue_name();
        let mut consumers = self.consumers.lock().await;
        if !consumers.contains_key(base) {
            let consumer = self
                .channel
                .basic_consume(
                    base,
                    &format!("{base}-consumer"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            consumers.insert(base, consumer);
        }
        let consumer = consumers.get_mut(base).expect("just inserted");

        match tokio::time::timeout(Duration::from_millis(50), consumer.next()).await {
            Ok(Some(delivery)) => {
                let delivery = delivery?;
                let job: QueueJob = serde_json::from_slice(&delivery.data)?;
                Ok(Some(Delivery {
                    job,
                    handle: DeliveryHandle::Lapin(delivery),
                }))
            }
            Ok(None) | Err(_) => Ok(None),
        }
    }

    async fn ack(&self, delivery: Delivery) -> Result<()> {
        match delivery.handle {
            DeliveryHandle::Lapin(d) => {
                d.ack(BasicAckOptions::default()).await?;
                Ok(())
            }
            DeliveryHandle::InMemory(_) => Err(anyhow!("in-memory delivery handed to LapinQueue")),
        }
    }

    async fn nack(&self, delivery: Delivery) -> Result<()> {
        match delivery.handle {
            DeliveryHandle::Lapin(d) => {
                let mut job = delivery.job;
                job.retry_count += 1;
                let rung_index = (job.retry_count.max(0) as usize).min(DELAY_RUNGS_SECS.len() - 1);
                let delay = Duration::from_secs(DELAY_RUNGS_SECS[rung_index]);

                d.ack(BasicAckOptions::default()).await?;
                self.publish(job, delay).await
            }
            DeliveryHandle::InMemory(_) => Err(anyhow!("in-memory delivery handed to LapinQueue")),
        }
    }

    async fn nack_to_dlq(&self, delivery: Delivery) -> Result<()> {
        match delivery.handle {
            DeliveryHandle::Lapin(d) => {
                let job = delivery.job;
                let payload = serde_json::to_vec(&job)?;
                let dlq = dead_letter_queue_name(job.message_type);

                d.ack(BasicAckOptions::default()).await?;
                let confirm = self
                    .channel
                    .basic_publish(
                        "",
                        &dlq,
                        BasicPublishOptions::default(),
                        &payload,
                        BasicProperties::default().with_delivery_mode(2),
                    )
                    .await?;
                confirm.await?;
                Ok(())
            }
            DeliveryHandle::InMemory(_) => Err(anyhow!("in-memory delivery handed to LapinQueue")),
        }
    }
}

/// Jobs that exhausted the retry ladder land here for manual inspection;
/// exposed as a function so both topology setup and publish targeting
/// (`LapinQueue::nack_to_dlq`) share the same naming scheme.
pub fn dead_letter_queue_name(message_type: MessageType) -> String {
    format!("{}.dlq", message_type.queue_name())
}
