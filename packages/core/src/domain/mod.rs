pub mod idempotency;
pub mod message;
pub mod queue;
pub mod reschedule;
pub mod scheduler;
pub mod sender;
pub mod timezone;
pub mod user;
pub mod worker;
