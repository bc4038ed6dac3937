//! In-memory `Queue` double for tests that exercise the scheduler and
//! worker pool without a broker connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::domain::message::MessageType;

use super::model::{QueueJob, MAX_MESSAGE_BYTES};
use super::{Delivery, DeliveryHandle, Queue};

struct Lane {
    ready: VecDeque<QueueJob>,
    in_flight: std::collections::HashMap<u64, QueueJob>,
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: std::collections::HashMap::new(),
        }
    }
}

#[derive(Default)]
pub struct InMemoryQueue {
    birthday: Mutex<Lane>,
    anniversary: Mutex<Lane>,
    next_handle: AtomicU64,
    published: Mutex<Vec<(QueueJob, Duration)>>,
    nacked: Mutex<Vec<QueueJob>>,
    dlq: Mutex<Vec<QueueJob>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, message_type: MessageType) -> &Mutex<Lane> {
        match message_type {
            MessageType::Birthday => &self.birthday,
            MessageType::Anniversary => &self.anniversary,
        }
    }

    pub fn published_jobs(&self) -> Vec<(QueueJob, Duration)> {
        self.published.lock().unwrap().clone()
    }

    pub fn nacked_jobs(&self) -> Vec<QueueJob> {
        self.nacked.lock().unwrap().clone()
    }

    pub fn dlq_jobs(&self) -> Vec<QueueJob> {
        self.dlq.lock().unwrap().clone()
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn publish(&self, job: QueueJob, delay: Duration) -> Result<()> {
        let payload_len = serde_json::to_vec(&job)?.len();
        if payload_len > MAX_MESSAGE_BYTES {
            return Err(anyhow!("queue payload exceeds size limit"));
        }

        self.published.lock().unwrap().push((job.clone(), delay));
        self.lane(job.message_type).lock().unwrap().ready.push_back(job);
        Ok(())
    }

    async fn poll(&self, message_type: MessageType) -> Result<Option<Delivery>> {
        let mut lane = self.lane(message_type).lock().unwrap();
        let Some(job) = lane.ready.pop_front() else {
            return Ok(None);
        };

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        lane.in_flight.insert(handle, job.clone());

        Ok(Some(Delivery {
            job,
            handle: DeliveryHandle::InMemory(handle),
        }))
    }

    async fn ack(&self, delivery: Delivery) -> Result<()> {
        let DeliveryHandle::InMemory(handle) = delivery.handle else {
            return Err(anyhow!("lapin delivery handed to InMemoryQueue"));
        };
        self.lane(delivery.job.message_type)
            .lock()
            .unwrap()
            .in_flight
            .remove(&handle);
        Ok(())
    }

    async fn nack(&self, delivery: Delivery) -> Result<()> {
        let DeliveryHandle::InMemory(handle) = delivery.handle else {
            return Err(anyhow!("lapin delivery handed to InMemoryQueue"));
        };
        let mut job = delivery.job;
        job.retry_count += 1;

        let mut lane = self.lane(job.message_type).lock().unwrap();
        lane.in_flight.remove(&handle);
        self.nacked.lock().unwrap().push(job.clone());
        lane.ready.push_back(job);
        Ok(())
    }

    async fn nack_to_dlq(&self, delivery: Delivery) -> Result<()> {
        let DeliveryHandle::InMemory(handle) = delivery.handle else {
            return Err(anyhow!("lapin delivery handed to InMemoryQueue"));
        };
        self.lane(delivery.job.message_type)
            .lock()
            .unwrap()
            .in_flight
            .remove(&handle);
        self.dlq.lock().unwrap().push(delivery.job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MessageId, UserId};

    fn job() -> QueueJob {
        QueueJob {
            message_id: MessageId::new(),
            user_id: UserId::new(),
            message_type: MessageType::Birthday,
            retry_count: 0,
            idempotency_key: "k".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_then_poll_returns_the_job() {
        let queue = InMemoryQueue::new();
        let j = job();
        queue.publish(j.clone(), Duration::ZERO).await.unwrap();

        let delivery = queue.poll(MessageType::Birthday).await.unwrap().unwrap();
        assert_eq!(delivery.job.message_id, j.message_id);
    }

    #[tokio::test]
    async fn nack_requeues_for_redelivery() {
        let queue = InMemoryQueue::new();
        queue.publish(job(), Duration::ZERO).await.unwrap();

        let delivery = queue.poll(MessageType::Birthday).await.unwrap().unwrap();
        queue.nack(delivery).await.unwrap();

        let redelivered = queue.poll(MessageType::Birthday).await.unwrap();
        assert!(redelivered.is_some());
    }

    #[tokio::test]
    async fn nack_to_dlq_does_not_requeue() {
        let queue = InMemoryQueue::new();
        queue.publish(job(), Duration::ZERO).await.unwrap();

        let delivery = queue.poll(MessageType::Birthday).await.unwrap().unwrap();
        queue.nack_to_dlq(delivery).await.unwrap();

        assert!(queue.poll(MessageType::Birthday).await.unwrap().is_none());
        assert_eq!(queue.dlq_jobs().len(), 1);
    }

    #[tokio::test]
    async fn nack_increments_retry_count() {
        let queue = InMemoryQueue::new();
        queue.publish(job(), Duration::ZERO).await.unwrap();

        let delivery = queue.poll(MessageType::Birthday).await.unwrap().unwrap();
        queue.nack(delivery).await.unwrap();

        let redelivered = queue.poll(MessageType::Birthday).await.unwrap().unwrap();
        assert_eq!(redelivered.job.retry_count, 1);
    }

    #[tokio::test]
    async fn lanes_are_independent_per_type() {
        let queue = InMemoryQueue::new();
        let mut anniversary_job = job();
        anniversary_job.message_type = MessageType::Anniversary;

        queue.publish(job(), Duration::ZERO).await.unwrap();
        queue.publish(anniversary_job, Duration::ZERO).await.unwrap();

        assert!(queue.poll(MessageType::Birthday).await.unwrap().is_some());
        assert!(queue.poll(MessageType::Anniversary).await.unwrap().is_some());
        assert!(queue.poll(MessageType::Birthday).await.unwrap().is_none());
    }
}
