pub mod in_memory;
pub mod lapin_queue;
pub mod model;

pub use in_memory::InMemoryQueue;
pub use lapin_queue::LapinQueue;
pub use model::{QueueJob, DEFAULT_PREFETCH, MAX_MESSAGE_BYTES, MAX_RETRIES};

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::message::MessageType;

/// A delivered job plus the broker-specific handle needed to ack/nack it.
/// Opaque to callers; only `Queue::ack`/`Queue::nack` interpret it.
pub struct Delivery {
    pub job: QueueJob,
    pub(crate) handle: DeliveryHandle,
}

pub(crate) enum DeliveryHandle {
    Lapin(lapin::message::Delivery),
    InMemory(u64),
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Publish with a future dispatch delay. Rejects payloads over
    /// [`MAX_MESSAGE_BYTES`]. Returns only after the broker confirms
    /// persistence.
    async fn publish(&self, job: QueueJob, delay: Duration) -> Result<()>;

    /// Pull the next ready delivery for `message_type`, or `None` if the
    /// queue is empty right now. Honors the configured consumer prefetch.
    async fn poll(&self, message_type: MessageType) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: Delivery) -> Result<()>;

    /// Nack with requeue, routing through the delay/backoff ladder keyed by
    /// `delivery.job.retry_count`. Callers are responsible for deciding when
    /// a job has exhausted [`MAX_RETRIES`] and routing to
    /// [`Queue::nack_to_dlq`] instead.
    async fn nack(&self, delivery: Delivery) -> Result<()>;

    /// Route a message that has exhausted its retries to the terminal DLQ
    /// for its type, for manual inspection. Does not touch the delay ladder.
    async fn nack_to_dlq(&self, delivery: Delivery) -> Result<()>;
}
