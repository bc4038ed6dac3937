//! Recovery loop: reclaims messages stuck past their scheduled time plus a
//! grace period, either retrying them or escalating to a terminal failure.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::message::{MessageStatus, MessageStore};
use crate::kernel::health::HealthSnapshot;
use crate::kernel::service::Service;

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(600);
const GRACE: Duration = Duration::minutes(10);
const MAX_RETRIES: i32 = 5;
const LOOP_NAME: &str = "recovery-sweeper";

pub struct RecoverySweeper {
    message_store: Arc<dyn MessageStore>,
    health: Arc<HealthSnapshot>,
}

impl RecoverySweeper {
    pub fn new(message_store: Arc<dyn MessageStore>, health: Arc<HealthSnapshot>) -> Self {
        Self { message_store, health }
    }

    async fn run_once(&self) {
        let now = chrono::Utc::now();
        let missed = match self.message_store.find_missed(now, GRACE).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to query missed messages");
                self.health.record_loop_error(LOOP_NAME).await;
                return;
            }
        };

        let mut ok = true;
        for record in missed {
            if record.status == MessageStatus::Sending {
                warn!(message_id = %record.id, "reclaiming orphaned sending record");
            }

            if record.retry_count >= MAX_RETRIES {
                if let Err(e) = self
                    .message_store
                    .mark_failed(record.id, "exceeded retry bound during recovery sweep", MAX_RETRIES)
                    .await
                {
                    error!(message_id = %record.id, error = %e, "failed to mark record failed-terminal");
                    ok = false;
                }
                continue;
            }

            if let Err(e) = self
                .message_store
                .transition_status(record.id, record.status, MessageStatus::Scheduled, None)
                .await
            {
                error!(message_id = %record.id, error = %e, "failed to reset record to scheduled");
                ok = false;
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
impl Service for RecoverySweeper {
    fn name(&self) -> &'static str {
        "recovery-sweeper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.run_once().await,
            }
        }
        info!("recovery sweeper stopped");
        Ok(())
    }
}
