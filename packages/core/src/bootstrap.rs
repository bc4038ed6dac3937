//! Constructs the full, acyclic dependency graph and hands it to a
//! [`Supervisor`]. This is the only function allowed to call
//! [`Config::from_env`].

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use vendor_client::{VendorClient, VendorOptions};

use crate::config::Config;
use crate::domain::message::PostgresMessageStore;
use crate::domain::queue::LapinQueue;
use crate::domain::scheduler::{DailyMaterializer, MinuteEnqueuer, RecoverySweeper};
use crate::domain::sender::circuit_breaker::CircuitBreaker;
use crate::domain::sender::VendorOutboundSender;
use crate::domain::user::PostgresUserStore;
use crate::domain::worker::{WorkerPool, WorkerPoolConfig};
use crate::kernel::{AppKernel, Supervisor};

pub async fn bootstrap() -> Result<(Arc<AppKernel>, Supervisor)> {
    let config = Config::from_env()?;

    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let message_store = Arc::new(PostgresMessageStore::new(db_pool.clone()));
    let user_store = Arc::new(PostgresUserStore::new(db_pool.clone()));
    let queue = Arc::new(LapinQueue::connect(&config.amqp_url, config.queue_prefetch).await?);

    let vendor_client = VendorClient::new(VendorOptions {
        base_url: config.vendor_base_url.clone(),
    });
    let breaker = CircuitBreaker::new(
        config.circuit_breaker_min_calls,
        config.circuit_breaker_error_rate,
        config.circuit_breaker_open_duration,
    );
    let sender = Arc::new(VendorOutboundSender::new(vendor_client, breaker));

    let kernel = Arc::new(AppKernel::new(
        db_pool,
        message_store.clone(),
        user_store.clone(),
        queue.clone(),
        sender.clone(),
    ));

    let supervisor = Supervisor::new()
        .with_service(Box::new(DailyMaterializer::new(
            user_store.clone(),
            message_store.clone(),
            kernel.health.clone(),
        )))
        .with_service(Box::new(MinuteEnqueuer::new(
            message_store.clone(),
            queue.clone(),
            kernel.health.clone(),
        )))
        .with_service(Box::new(RecoverySweeper::new(message_store.clone(), kernel.health.clone())))
        .with_service(Box::new(WorkerPool::new(
            message_store,
            user_store,
            queue,
            sender,
            WorkerPoolConfig {
                worker_count: config.worker_count,
            },
            kernel.health.clone(),
        )));

    Ok((kernel, supervisor))
}
