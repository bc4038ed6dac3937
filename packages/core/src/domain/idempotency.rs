//! Idempotency key derivation for message records.
//!
//! Keys have the form `<user-id>:<TYPE>:<YYYY-MM-DD>` and are the sole
//! mechanism preventing a second message of the same kind from being
//! scheduled for the same user on the same calendar date.

use chrono::NaiveDate;
use thiserror::Error;

use crate::common::UserId;
use crate::domain::message::MessageType;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdempotencyKeyError {
    #[error("idempotency key is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn generate(user_id: UserId, message_type: MessageType, date: NaiveDate) -> Self {
        Self(format!(
            "{}:{}:{}",
            user_id,
            message_type.as_str(),
            date.format("%Y-%m-%d")
        ))
    }

    pub fn parse(raw: &str) -> Result<Self, IdempotencyKeyError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(IdempotencyKeyError::Malformed(raw.to_string()));
        }

        let [user_id, message_type, date] = [parts[0], parts[1], parts[2]];
        if user_id.is_empty() {
            return Err(IdempotencyKeyError::Malformed(raw.to_string()));
        }
        uuid::Uuid::parse_str(user_id)
            .map_err(|_| IdempotencyKeyError::Malformed(raw.to_string()))?;
        MessageType::from_str(message_type)
            .map_err(|_| IdempotencyKeyError::Malformed(raw.to_string()))?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| IdempotencyKeyError::Malformed(raw.to_string()))?;

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into (user_id, message_type, date) components.
    pub fn components(&self) -> (UserId, MessageType, NaiveDate) {
        let mut parts = self.0.splitn(3, ':');
        let user_id = UserId::parse(parts.next().expect("validated on construction")).expect("validated");
        let message_type =
            MessageType::from_str(parts.next().expect("validated on construction")).expect("validated");
        let date = NaiveDate::parse_from_str(parts.next().expect("validated on construction"), "%Y-%m-%d")
            .expect("validated");
        (user_id, message_type, date)
    }

    pub fn same_user_and_date(&self, other: &IdempotencyKey) -> bool {
        let (user_a, _, date_a) = self.components();
        let (user_b, _, date_b) = other.components();
        user_a == user_b && date_a == date_b
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::entity_ids::UserId;

    #[test]
    fn generate_then_parse_roundtrips() {
        let user_id = UserId::new();
        let date = NaiveDate::from_ymd_opt(2026, 7, 27).unwrap();
        let key = IdempotencyKey::generate(user_id, MessageType::Birthday, date);

        let parsed = IdempotencyKey::parse(key.as_str()).unwrap();
        assert_eq!(key, parsed);

        let (parsed_user, parsed_type, parsed_date) = parsed.components();
        assert_eq!(parsed_user, user_id);
        assert_eq!(parsed_type, MessageType::Birthday);
        assert_eq!(parsed_date, date);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(IdempotencyKey::parse("").is_err());
        assert!(IdempotencyKey::parse("not-a-uuid:BIRTHDAY:2026-07-27").is_err());
        assert!(IdempotencyKey::parse(&format!("{}:NOT_A_TYPE:2026-07-27", UserId::new())).is_err());
        assert!(IdempotencyKey::parse(&format!("{}:BIRTHDAY:not-a-date", UserId::new())).is_err());
    }

    #[test]
    fn same_user_and_date_ignores_message_type() {
        let user_id = UserId::new();
        let date = NaiveDate::from_ymd_opt(2026, 7, 27).unwrap();
        let a = IdempotencyKey::generate(user_id, MessageType::Birthday, date);
        let b = IdempotencyKey::generate(user_id, MessageType::Anniversary, date);
        assert!(a.same_user_and_date(&b));
    }
}
