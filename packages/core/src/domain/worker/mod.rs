//! Worker pool: consume from the queue, dedupe, send, record, ack/nack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::message::{MessageStatus, MessageStore, MessageType};
use crate::domain::queue::{Delivery, Queue};
use crate::domain::sender::OutboundSender;
use crate::domain::user::UserStore;
use crate::kernel::health::HealthSnapshot;
use crate::kernel::service::Service;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: i32 = 5;
const LOOP_NAME: &str = "worker-pool";

pub struct WorkerPoolConfig {
    pub worker_count: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { worker_count: 5 }
    }
}

pub struct WorkerPool {
    message_store: Arc<dyn MessageStore>,
    user_store: Arc<dyn UserStore>,
    queue: Arc<dyn Queue>,
    sender: Arc<dyn OutboundSender>,
    config: WorkerPoolConfig,
    health: Arc<HealthSnapshot>,
}

impl WorkerPool {
    pub fn new(
        message_store: Arc<dyn MessageStore>,
        user_store: Arc<dyn UserStore>,
        queue: Arc<dyn Queue>,
        sender: Arc<dyn OutboundSender>,
        config: WorkerPoolConfig,
        health: Arc<HealthSnapshot>,
    ) -> Self {
        Self {
            message_store,
            user_store,
            queue,
            sender,
            config,
            health,
        }
    }

    async fn process_one(
        message_store: &Arc<dyn MessageStore>,
        user_store: &Arc<dyn UserStore>,
        queue: &Arc<dyn Queue>,
        sender: &Arc<dyn OutboundSender>,
        delivery: Delivery,
    ) {
        let message_id = delivery.job.message_id;

        let record = match message_store.find_by_id(message_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(%message_id, "queued message has no backing record, acking and dropping");
                Self::ack(queue, delivery).await;
                return;
            }
            Err(e) => {
                error!(%message_id, error = %e, "failed to load message record, nacking for retry");
                Self::nack(queue, delivery).await;
                return;
            }
        };

        if record.status == MessageStatus::Sent {
            debug!(%message_id, "already sent, acking duplicate delivery");
            Self::ack(queue, delivery).await;
            return;
        }

        let claimed = match message_store
            .transition_status(message_id, MessageStatus::Queued, MessageStatus::Sending, None)
            .await
        {
            Ok(true) => true,
            Ok(false) => false,
            Err(e) => {
                error!(%message_id, error = %e, "failed to claim message for sending");
                Self::nack(queue, delivery).await;
                return;
            }
        };

        if !claimed {
            debug!(%message_id, "another worker already claimed this message");
            Self::ack(queue, delivery).await;
            return;
        }

        let user = match user_store.find_by_id(record.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(user_id = %record.user_id, "user no longer exists, failing message terminally");
                // max_retries=0 forces FailedTerminal regardless of the
                // record's current retry_count: a missing user will never
                // resolve itself on retry.
                match message_store.mark_failed(message_id, "user not found", 0).await {
                    Ok(MessageStatus::FailedTerminal) => Self::nack_to_dlq(queue, delivery).await,
                    Ok(_) => Self::nack(queue, delivery).await,
                    Err(e) => {
                        error!(%message_id, error = %e, "failed to record terminal failure for missing user");
                        Self::nack(queue, delivery).await;
                    }
                }
                return;
            }
            Err(e) => {
                error!(user_id = %record.user_id, error = %e, "failed to load user, nacking for retry");
                Self::nack(queue, delivery).await;
                return;
            }
        };

        match sender.send(&user, &record.body, &record.idempotency_key).await {
            Ok(vendor_status) => {
                if let Err(e) = message_store.mark_sent(message_id, vendor_status).await {
                    error!(%message_id, error = %e, "sent but failed to record sent status");
                }
                Self::ack(queue, delivery).await;
            }
            Err(e) => {
                warn!(%message_id, error = %e, "send failed");
                match message_store.mark_failed(message_id, &e.to_string(), MAX_RETRIES).await {
                    Ok(MessageStatus::FailedTerminal) => {
                        Self::nack_to_dlq(queue, delivery).await;
                    }
                    Ok(_) => {
                        Self::nack(queue, delivery).await;
                    }
                    Err(e) => {
                        error!(%message_id, error = %e, "failed to record send failure");
                        Self::nack(queue, delivery).await;
                    }
                }
            }
        }
    }

    async fn ack(queue: &Arc<dyn Queue>, delivery: Delivery) {
        if let Err(e) = queue.ack(delivery).await {
            error!(error = %e, "failed to ack delivery");
        }
    }

    async fn nack(queue: &Arc<dyn Queue>, delivery: Delivery) {
        if let Err(e) = queue.nack(delivery).await {
            error!(error = %e, "failed to nack delivery for retry");
        }
    }

    async fn nack_to_dlq(queue: &Arc<dyn Queue>, delivery: Delivery) {
        if let Err(e) = queue.nack_to_dlq(delivery).await {
            error!(error = %e, "failed to route exhausted delivery to the dead-letter queue");
        }
    }

    /// One poll-and-process round across every message type. Returns whether
    /// any delivery was processed, for the caller's idle-sleep decision.
    async fn tick(
        message_store: &Arc<dyn MessageStore>,
        user_store: &Arc<dyn UserStore>,
        queue: &Arc<dyn Queue>,
        sender: &Arc<dyn OutboundSender>,
        health: &Arc<HealthSnapshot>,
    ) -> bool {
        let mut did_work = false;
        let mut poll_ok = true;
        for message_type in [MessageType::Birthday, MessageType::Anniversary] {
            match queue.poll(message_type).await {
                Ok(Some(delivery)) => {
                    did_work = true;
                    Self::process_one(message_store, user_store, queue, sender, delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, ?message_type, "failed to poll queue");
                    poll_ok = false;
                }
            }
        }

        if poll_ok {
            health.record_loop_success(LOOP_NAME).await;
        } else {
            health.record_loop_error(LOOP_NAME).await;
        }
        did_work
    }

    async fn worker_loop(
        message_store: Arc<dyn MessageStore>,
        user_store: Arc<dyn UserStore>,
        queue: Arc<dyn Queue>,
        sender: Arc<dyn OutboundSender>,
        health: Arc<HealthSnapshot>,
        shutdown: CancellationToken,
    ) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let did_work = Self::tick(&message_store, &user_store, &queue, &sender, &health).await;

            if !did_work {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
            }
        }
    }
}

#[async_trait]
impl Service for WorkerPool {
    fn name(&self) -> &'static str {
        "worker-pool"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(workers = self.config.worker_count, "worker pool starting");

        let mut handles = Vec::with_capacity(self.config.worker_count);
        for _ in 0..self.config.worker_count {
            let message_store = self.message_store.clone();
            let user_store = self.user_store.clone();
            let queue = self.queue.clone();
            let sender = self.sender.clone();
            let health = self.health.clone();
            let worker_shutdown = shutdown.clone();

            handles.push(tokio::spawn(Self::worker_loop(
                message_store,
                user_store,
                queue,
                sender,
                health,
                worker_shutdown,
            )));
        }

        shutdown.cancelled().await;
        info!("worker pool draining in-flight work");

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("worker pool drain deadline exceeded, some workers may still be finishing up");
        }

        info!("worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MessageId, UserId};
    use crate::domain::message::{InMemoryMessageStore, MessageRecord};
    use crate::domain::queue::{InMemoryQueue, QueueJob};
    use crate::domain::sender::ScriptedOutboundSender;
    use crate::domain::user::{InMemoryUserStore, User};

    fn ada() -> User {
        User {
            id: UserId::new(),
            first_name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            timezone: "America/New_York".to_string(),
            birthday: None,
            anniversary: None,
            deleted: false,
        }
    }

    async fn seed(user: &User, status: MessageStatus) -> (Arc<InMemoryMessageStore>, MessageId) {
        seed_with_retry_count(user, status, 0).await
    }

    async fn seed_with_retry_count(
        user: &User,
        status: MessageStatus,
        retry_count: i32,
    ) -> (Arc<InMemoryMessageStore>, MessageId) {
        let record = MessageRecord::builder()
            .user_id(user.id)
            .message_type(MessageType::Birthday)
            .body("Hey Ada, happy birthday!".to_string())
            .scheduled_send_at(chrono::Utc::now())
            .idempotency_key("k".to_string())
            .status(status)
            .retry_count(retry_count)
            .build();
        let message_id = record.id;
        let message_store = Arc::new(InMemoryMessageStore::new());
        message_store.create(record).await.unwrap();
        (message_store, message_id)
    }

    async fn deliver(queue: &InMemoryQueue, message_id: MessageId, user_id: UserId) -> Delivery {
        queue
            .publish(
                QueueJob {
                    message_id,
                    user_id,
                    message_type: MessageType::Birthday,
                    retry_count: 0,
                    idempotency_key: "k".to_string(),
                },
                Duration::ZERO,
            )
            .await
            .unwrap();
        queue.poll(MessageType::Birthday).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn successful_send_marks_sent_and_acks() {
        let user = ada();
        let (message_store, message_id) = seed(&user, MessageStatus::Queued).await;
        let user_store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new(vec![user.clone()]));
        let queue = Arc::new(InMemoryQueue::new());
        let delivery = deliver(&queue, message_id, user.id).await;
        let sender: Arc<dyn OutboundSender> = Arc::new(ScriptedOutboundSender::always_succeeds(200));
        let message_store_dyn: Arc<dyn MessageStore> = message_store.clone();

        WorkerPool::process_one(&message_store_dyn, &user_store, &(queue.clone() as Arc<dyn Queue>), &sender, delivery).await;

        let updated = message_store.find_by_id(message_id).await.unwrap().unwrap();
        assert_eq!(updated.status, MessageStatus::Sent);
        assert!(queue.nacked_jobs().is_empty());
    }

    #[tokio::test]
    async fn failed_send_nacks_for_retry_while_under_the_retry_bound() {
        let user = ada();
        let (message_store, message_id) = seed(&user, MessageStatus::Queued).await;
        let user_store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new(vec![user.clone()]));
        let queue = Arc::new(InMemoryQueue::new());
        let delivery = deliver(&queue, message_id, user.id).await;
        let sender: Arc<dyn OutboundSender> = Arc::new(ScriptedOutboundSender::always_fails("vendor rejected"));
        let message_store_dyn: Arc<dyn MessageStore> = message_store.clone();

        WorkerPool::process_one(&message_store_dyn, &user_store, &(queue.clone() as Arc<dyn Queue>), &sender, delivery).await;

        let updated = message_store.find_by_id(message_id).await.unwrap().unwrap();
        assert_eq!(updated.status, MessageStatus::FailedRetry);
        assert_eq!(queue.nacked_jobs().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_route_to_the_dead_letter_queue_instead_of_vanishing() {
        let user = ada();
        let (message_store, message_id) = seed_with_retry_count(&user, MessageStatus::Queued, MAX_RETRIES - 1).await;
        let user_store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new(vec![user.clone()]));
        let queue = Arc::new(InMemoryQueue::new());
        let delivery = deliver(&queue, message_id, user.id).await;
        let sender: Arc<dyn OutboundSender> = Arc::new(ScriptedOutboundSender::always_fails("vendor rejected"));
        let message_store_dyn: Arc<dyn MessageStore> = message_store.clone();

        WorkerPool::process_one(&message_store_dyn, &user_store, &(queue.clone() as Arc<dyn Queue>), &sender, delivery).await;

        let updated = message_store.find_by_id(message_id).await.unwrap().unwrap();
        assert_eq!(updated.status, MessageStatus::FailedTerminal);
        assert_eq!(queue.dlq_jobs().len(), 1);
        assert!(queue.nacked_jobs().is_empty());
    }

    #[tokio::test]
    async fn poll_failure_records_loop_error() {
        use crate::domain::sender::circuit_breaker::CircuitState;

        let message_store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let user_store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new(vec![]));
        let queue: Arc<dyn Queue> = Arc::new(PollFailingQueue);
        let sender: Arc<dyn OutboundSender> = Arc::new(ScriptedOutboundSender::always_succeeds(200));
        let health = HealthSnapshot::new();

        WorkerPool::tick(&message_store, &user_store, &queue, &sender, &health).await;

        assert_eq!(
            health.overall(CircuitState::Closed).await,
            crate::kernel::health::HealthState::Degraded
        );
    }

    struct PollFailingQueue;

    #[async_trait]
    impl Queue for PollFailingQueue {
        async fn publish(&self, _job: crate::domain::queue::QueueJob, _delay: Duration) -> Result<()> {
            unreachable!("not exercised in this test")
        }

        async fn poll(&self, _message_type: MessageType) -> Result<Option<Delivery>> {
            Err(anyhow::anyhow!("broker connection dropped"))
        }

        async fn ack(&self, _delivery: Delivery) -> Result<()> {
            unreachable!("not exercised in this test")
        }

        async fn nack(&self, _delivery: Delivery) -> Result<()> {
            unreachable!("not exercised in this test")
        }

        async fn nack_to_dlq(&self, _delivery: Delivery) -> Result<()> {
            unreachable!("not exercised in this test")
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_for_already_sent_message_is_acked_without_resend() {
        let user = ada();
        let (message_store, message_id) = seed(&user, MessageStatus::Sent).await;
        let user_store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new(vec![user.clone()]));
        let queue = Arc::new(InMemoryQueue::new());
        let delivery = deliver(&queue, message_id, user.id).await;
        let sender = Arc::new(ScriptedOutboundSender::always_succeeds(200));
        let sender_dyn: Arc<dyn OutboundSender> = sender.clone();
        let message_store_dyn: Arc<dyn MessageStore> = message_store.clone();

        WorkerPool::process_one(&message_store_dyn, &user_store, &(queue.clone() as Arc<dyn Queue>), &sender_dyn, delivery).await;

        assert_eq!(sender.call_count(), 0);
        assert!(queue.nacked_jobs().is_empty());
    }
}
