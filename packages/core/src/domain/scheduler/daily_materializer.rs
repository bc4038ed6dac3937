//! Daily loop: for every user whose birthday or anniversary falls today in
//! their own timezone, materialize a SCHEDULED message record.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use futures::StreamExt;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::idempotency::IdempotencyKey;
use crate::domain::message::{MessageRecord, MessageStatus, MessageStore, MessageType};
use crate::domain::timezone::{self, CalendarDay};
use crate::domain::user::{User, UserStore};
use crate::kernel::health::HealthSnapshot;
use crate::kernel::service::Service;

/// Every 6 hours, per the recommended cadence for this loop.
const CRON_SCHEDULE: &str = "0 0 0,6,12,18 * * *";
const LOOP_NAME: &str = "daily-materializer";

pub struct DailyMaterializer {
    user_store: Arc<dyn UserStore>,
    message_store: Arc<dyn MessageStore>,
    health: Arc<HealthSnapshot>,
}

impl DailyMaterializer {
    pub fn new(
        user_store: Arc<dyn UserStore>,
        message_store: Arc<dyn MessageStore>,
        health: Arc<HealthSnapshot>,
    ) -> Self {
        Self {
            user_store,
            message_store,
            health,
        }
    }

    /// Returns `false` if some step failed, so `run_once` can report the
    /// pass's health accurately instead of always assuming success.
    async fn materialize_for(&self, user: &User, calendar_day: NaiveDate, message_type: MessageType) -> bool {
        let Some(day) = CalendarDay::new(calendar_day.month(), calendar_day.day()) else {
            warn!(user_id = %user.id, "user has an invalid calendar day on file");
            return true;
        };

        let Ok(zone) = timezone::validate_zone(&user.timezone) else {
            warn!(user_id = %user.id, zone = %user.timezone, "user has an invalid timezone on file");
            return true;
        };

        let now = Utc::now();
        if !timezone::is_anniversary_today(day, zone, now) {
            return true;
        }

        let today_local = now.with_timezone(&zone).date_naive();
        let key = IdempotencyKey::generate(user.id, message_type, today_local);

        match self.message_store.check_idempotency(key.as_str()).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                error!(user_id = %user.id, error = %e, "idempotency check failed");
                return false;
            }
        }

        let year = now.with_timezone(&zone).date_naive().year();
        let send_at = match timezone::compute_send_instant(day, zone, year) {
            Ok(instant) => instant,
            Err(e) => {
                error!(user_id = %user.id, error = %e, "failed to compute send instant");
                return false;
            }
        };

        let body = message_type.render(&user.first_name);
        let record = MessageRecord::new_scheduled(user.id, message_type, body, send_at, key.as_str().to_string());

        if let Err(e) = self.message_store.create(record).await {
            error!(user_id = %user.id, error = %e, "failed to create scheduled message record");
            return false;
        }
        true
    }

    async fn run_once(&self) {
        info!("daily materializer pass starting");
        let mut ok = true;

        let mut birthdays = self.user_store.users_with_birthday_near_today();
        while let Some(result) = birthdays.next().await {
            match result {
                Ok(user) => {
                    if let Some(birthday) = user.birthday {
                        ok &= self.materialize_for(&user, birthday, MessageType::Birthday).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to read a candidate user");
                    ok = false;
                }
            }
        }

        let mut anniversaries = self.user_store.users_with_anniversary_near_today();
        while let Some(result) = anniversaries.next().await {
            match result {
                Ok(user) => {
                    if let Some(anniversary) = user.anniversary {
                        ok &= self.materialize_for(&user, anniversary, MessageType::Anniversary).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to read a candidate user");
                    ok = false;
                }
            }
        }

        if ok {
            self.health.record_loop_success(LOOP_NAME).await;
        } else {
            self.health.record_loop_error(LOOP_NAME).await;
        }
        info!("daily materializer pass complete");
    }
}

#[async_trait]
impl Service for DailyMaterializer {
    fn name(&self) -> &'static str {
        "daily-materializer"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut scheduler = JobScheduler::new().await?;
        let materializer = Arc::new(*self);

        let job_materializer = materializer.clone();
        let job = Job::new_async(CRON_SCHEDULE, move |_uuid, _lock| {
            let materializer = job_materializer.clone();
            Box::pin(async move {
                materializer.run_once().await;
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;

        // Run once immediately so the system doesn't wait up to the full
        // cadence after a cold start before the first materialization.
        materializer.run_once().await;

        shutdown.cancelled().await;
        scheduler.shutdown().await?;
        Ok(())
    }
}
