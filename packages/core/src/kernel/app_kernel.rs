//! `AppKernel` holds every shared dependency the domain services need and
//! provides access via trait objects for testability.

use std::sync::Arc;

use sqlx::PgPool;

use crate::domain::message::MessageStore;
use crate::domain::queue::Queue;
use crate::domain::sender::OutboundSender;
use crate::domain::user::UserStore;

use super::health::HealthSnapshot;

pub struct AppKernel {
    pub db_pool: PgPool,
    pub message_store: Arc<dyn MessageStore>,
    pub user_store: Arc<dyn UserStore>,
    pub queue: Arc<dyn Queue>,
    pub sender: Arc<dyn OutboundSender>,
    pub health: Arc<HealthSnapshot>,
}

impl AppKernel {
    pub fn new(
        db_pool: PgPool,
        message_store: Arc<dyn MessageStore>,
        user_store: Arc<dyn UserStore>,
        queue: Arc<dyn Queue>,
        sender: Arc<dyn OutboundSender>,
    ) -> Self {
        Self {
            db_pool,
            message_store,
            user_store,
            queue,
            sender,
            health: HealthSnapshot::new(),
        }
    }
}
