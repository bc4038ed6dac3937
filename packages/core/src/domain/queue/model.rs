use serde::{Deserialize, Serialize};

use crate::common::{MessageId, UserId};
use crate::domain::message::MessageType;

/// Wire form published to the broker. Not persisted directly; the message
/// record in Postgres remains the durable source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub message_type: MessageType,
    pub retry_count: i32,
    pub idempotency_key: String,
}

pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_PREFETCH: u16 = 5;
pub const MAX_RETRIES: i32 = 5;
