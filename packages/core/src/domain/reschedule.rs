//! Reacts to user mutations (timezone change, birthday/anniversary edit,
//! soft-delete) by terminating stale pending messages and, where still
//! applicable, scheduling fresh ones.
//!
//! This is not a long-running [`Service`](crate::kernel::service::Service):
//! it is invoked directly by the (out-of-scope) user CRUD layer whenever a
//! user record changes.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, Utc};
use tracing::{error, info, warn};

use crate::common::UserId;
use crate::domain::idempotency::IdempotencyKey;
use crate::domain::message::{MessageRecord, MessageStatus, MessageStore, MessageType};
use crate::domain::timezone::{self, CalendarDay};
use crate::domain::user::UserStore;

pub struct RescheduleService {
    user_store: Arc<dyn UserStore>,
    message_store: Arc<dyn MessageStore>,
}

impl RescheduleService {
    pub fn new(user_store: Arc<dyn UserStore>, message_store: Arc<dyn MessageStore>) -> Self {
        Self {
            user_store,
            message_store,
        }
    }

    /// Called after a user's timezone, birthday, or anniversary changes.
    /// There is no attempt to cancel a send already in flight: a CAS-guarded
    /// SCHEDULED row is the only state this can safely act on, so a message
    /// already past SCHEDULED may still reach the user on stale data.
    pub async fn reschedule(&self, user_id: UserId) -> Result<()> {
        let Some(user) = self.user_store.find_by_id(user_id).await? else {
            warn!(%user_id, "reschedule requested for unknown or deleted user");
            return Ok(());
        };

        let pending = self.message_store.find_pending_for_user(user_id).await?;
        for record in pending {
            if record.status != MessageStatus::Scheduled {
                continue;
            }
            match self
                .message_store
                .transition_status(
                    record.id,
                    MessageStatus::Scheduled,
                    MessageStatus::FailedTerminal,
                    Some("RESCHEDULED"),
                )
                .await
            {
                Ok(true) => info!(message_id = %record.id, "terminated stale scheduled message on reschedule"),
                Ok(false) => {}
                Err(e) => error!(message_id = %record.id, error = %e, "failed to terminate stale message"),
            }
        }

        let Ok(zone) = timezone::validate_zone(&user.timezone) else {
            warn!(%user_id, zone = %user.timezone, "user has an invalid timezone, nothing to reschedule");
            return Ok(());
        };

        let now = Utc::now();
        for (calendar_date, message_type) in [
            (user.birthday, MessageType::Birthday),
            (user.anniversary, MessageType::Anniversary),
        ] {
            let Some(calendar_date) = calendar_date else {
                continue;
            };
            let Some(day) = CalendarDay::new(calendar_date.month(), calendar_date.day()) else {
                continue;
            };
            if !timezone::is_anniversary_today(day, zone, now) {
                continue;
            }

            let today_local = now.with_timezone(&zone).date_naive();
            let key = IdempotencyKey::generate(user.id, message_type, today_local);
            if self.message_store.check_idempotency(key.as_str()).await? {
                continue;
            }

            let year = today_local.year();
            let Ok(send_at) = timezone::compute_send_instant(day, zone, year) else {
                continue;
            };
            if send_at <= now {
                continue;
            }

            let body = message_type.render(&user.first_name);
            let record =
                MessageRecord::new_scheduled(user.id, message_type, body, send_at, key.as_str().to_string());
            self.message_store.create(record).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::InMemoryMessageStore;
    use crate::domain::user::{InMemoryUserStore, User};
    use chrono_tz::Tz;

    #[tokio::test]
    async fn terminates_a_stale_scheduled_row_and_creates_a_fresh_one() {
        let zone: Tz = "America/Chicago".parse().unwrap();
        let today = Utc::now().with_timezone(&zone).date_naive();
        let user = User {
            id: UserId::new(),
            first_name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            timezone: "America/Chicago".to_string(),
            birthday: Some(chrono::NaiveDate::from_ymd_opt(1990, today.month(), today.day()).unwrap()),
            anniversary: None,
            deleted: false,
        };
        let user_id = user.id;

        let message_store = Arc::new(InMemoryMessageStore::new());
        let stale = MessageRecord::new_scheduled(
            user_id,
            MessageType::Birthday,
            "Hey Ada, happy birthday!".to_string(),
            Utc::now() + chrono::Duration::hours(1),
            "stale-key".to_string(),
        );
        message_store.create(stale.clone()).await.unwrap();

        let user_store = Arc::new(InMemoryUserStore::new(vec![user]));
        let service = RescheduleService::new(user_store, message_store.clone());

        service.reschedule(user_id).await.unwrap();

        let stale_after = message_store.find_by_id(stale.id).await.unwrap().unwrap();
        assert_eq!(stale_after.status, MessageStatus::FailedTerminal);
        assert_eq!(stale_after.last_error.as_deref(), Some("RESCHEDULED"));
    }

    #[tokio::test]
    async fn unknown_user_is_a_no_op() {
        let message_store = Arc::new(InMemoryMessageStore::new());
        let user_store = Arc::new(InMemoryUserStore::new(vec![]));
        let service = RescheduleService::new(user_store, message_store.clone());

        service.reschedule(UserId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn does_not_create_a_duplicate_when_idempotency_key_is_already_active() {
        let zone: Tz = "America/Chicago".parse().unwrap();
        let today = Utc::now().with_timezone(&zone).date_naive();
        let user = User {
            id: UserId::new(),
            first_name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            timezone: "America/Chicago".to_string(),
            birthday: Some(chrono::NaiveDate::from_ymd_opt(1990, today.month(), today.day()).unwrap()),
            anniversary: None,
            deleted: false,
        };
        let user_id = user.id;

        let message_store = Arc::new(InMemoryMessageStore::new());
        let key = IdempotencyKey::generate(user_id, MessageType::Birthday, today);
        let existing = MessageRecord::new_scheduled(
            user_id,
            MessageType::Birthday,
            "Hey Ada, happy birthday!".to_string(),
            Utc::now() + chrono::Duration::hours(1),
            key.as_str().to_string(),
        );
        message_store.create(existing).await.unwrap();

        let user_store = Arc::new(InMemoryUserStore::new(vec![user]));
        let service = RescheduleService::new(user_store, message_store.clone());

        service.reschedule(user_id).await.unwrap();

        let pending = message_store.find_pending_for_user(user_id).await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
