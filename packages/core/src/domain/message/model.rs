//! The message record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "message_type", rename_all = "snake_case")]
pub enum MessageType {
    Birthday,
    Anniversary,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Birthday => "BIRTHDAY",
            MessageType::Anniversary => "ANNIVERSARY",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "BIRTHDAY" => Ok(MessageType::Birthday),
            "ANNIVERSARY" => Ok(MessageType::Anniversary),
            _ => Err(()),
        }
    }

    pub fn render(&self, first_name: &str) -> String {
        match self {
            MessageType::Birthday => format!("Hey {}, happy birthday!", first_name),
            MessageType::Anniversary => format!("Hey {}, happy work anniversary!", first_name),
        }
    }

    /// The durable queue this message type is published to.
    pub fn queue_name(&self) -> &'static str {
        match self {
            MessageType::Birthday => "messages.birthday",
            MessageType::Anniversary => "messages.anniversary",
        }
    }
}

/// Status machine: SCHEDULED -> QUEUED -> SENDING -> SENT (terminal), with
/// FAILED-retry looping back to SCHEDULED via the recovery sweeper, and
/// FAILED-terminal once the retry bound is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "message_status", rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Scheduled,
    Queued,
    Sending,
    Sent,
    FailedRetry,
    FailedTerminal,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::FailedTerminal)
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct MessageRecord {
    #[builder(default = MessageId::new())]
    pub id: MessageId,

    pub user_id: UserId,
    pub message_type: MessageType,
    pub body: String,

    pub scheduled_send_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub actual_send_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub status: MessageStatus,
    #[builder(default = 0)]
    pub retry_count: i32,

    pub idempotency_key: String,

    #[builder(default, setter(strip_option))]
    pub last_vendor_status: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new_scheduled(
        user_id: UserId,
        message_type: MessageType,
        body: String,
        scheduled_send_at: DateTime<Utc>,
        idempotency_key: String,
    ) -> Self {
        Self::builder()
            .user_id(user_id)
            .message_type(message_type)
            .body(body)
            .scheduled_send_at(scheduled_send_at)
            .idempotency_key(idempotency_key)
            .build()
    }
}
