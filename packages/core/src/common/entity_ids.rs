//! Typed ID definitions for all domain entities.

pub use super::id::{Id, V4, V7};

/// Marker type for User entities.
pub struct User;

/// Marker type for MessageRecord entities.
pub struct Message;

pub type UserId = Id<User>;
pub type MessageId = Id<Message>;
