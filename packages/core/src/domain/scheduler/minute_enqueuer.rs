//! Minute loop: publishes SCHEDULED records whose send time falls within the
//! lookahead window to the broker, with a delay matching the remaining time
//! until dispatch, and transitions them to QUEUED.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::domain::message::{MessageStatus, MessageStore};
use crate::domain::queue::{Queue, QueueJob};
use crate::kernel::health::HealthSnapshot;
use crate::kernel::service::Service;

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(60);
const LOOKAHEAD: Duration = Duration::minutes(65);
const LOOP_NAME: &str = "minute-enqueuer";

pub struct MinuteEnqueuer {
    message_store: Arc<dyn MessageStore>,
    queue: Arc<dyn Queue>,
    health: Arc<HealthSnapshot>,
}

impl MinuteEnqueuer {
    pub fn new(message_store: Arc<dyn MessageStore>, queue: Arc<dyn Queue>, health: Arc<HealthSnapshot>) -> Self {
        Self {
            message_store,
            queue,
            health,
        }
    }

    async fn run_once(&self) {
        let now = Utc::now();
        let candidates = match self.message_store.find_scheduled_between(now, now + LOOKAHEAD).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to query scheduled messages");
                self.health.record_loop_error(LOOP_NAME).await;
                return;
            }
        };

        let mut ok = true;
        for record in candidates {
            let delay = (record.scheduled_send_at - now)
                .to_std()
                .unwrap_or(StdDuration::ZERO);

            let job = QueueJob {
                message_id: record.id,
                user_id: record.user_id,
                message_type: record.message_type,
                retry_count: record.retry_count,
                idempotency_key: record.idempotency_key.clone(),
            };

            if let Err(e) = self.queue.publish(job, delay).await {
                error!(message_id = %record.id, error = %e, "failed to publish to queue, leaving scheduled");
                ok = false;
                continue;
            }

            match self
                .message_store
                .transition_status(record.id, MessageStatus::Scheduled, MessageStatus::Queued, None)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    error!(message_id = %record.id, "publish succeeded but status transition lost a race");
                    ok = false;
                }
                Err(e) => {
                    error!(message_id = %record.id, error = %e, "failed to transition status to queued");
                    ok = false;
                }
            }
        }

        if ok {
            self.health.record_loop_success(LOOP_NAME).await;
        } else {
            self.health.record_loop_error(LOOP_NAME).await;
        }
    }
}

#[async_trait]
impl Service for MinuteEnqueuer {
    fn name(&self) -> &'static str {
        "minute-enqueuer"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.run_once().await,
            }
        }
        info!("minute enqueuer stopped");
        Ok(())
    }
}
