pub mod circuit_breaker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use vendor_client::{VendorClient, VendorError};

use crate::domain::user::User;

use circuit_breaker::{CircuitBreaker, CircuitBreakerOutcome};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("vendor call failed after retries: {0}")]
    Vendor(#[from] VendorError),
    #[error("circuit breaker is open")]
    CircuitOpen,
}

#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, user: &User, message: &str, idempotency_key: &str) -> Result<i32, SendError>;

    async fn circuit_state(&self) -> circuit_breaker::CircuitState;
}

/// Retries transient vendor failures with exponential backoff, all wrapped
/// in a circuit breaker so a sustained outage fails fast instead of queuing
/// up retries against a vendor that is already down.
pub struct VendorOutboundSender {
    client: VendorClient,
    breaker: Arc<CircuitBreaker>,
}

impl VendorOutboundSender {
    pub fn new(client: VendorClient, breaker: Arc<CircuitBreaker>) -> Self {
        Self { client, breaker }
    }

    async fn send_with_retry(&self, email: &str, message: &str, idempotency_key: &str) -> Result<i32, VendorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.send_message(email, message, idempotency_key).await {
                Ok(()) => return Ok(200),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(attempt, ?backoff, "transient vendor failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl OutboundSender for VendorOutboundSender {
    async fn send(&self, user: &User, message: &str, idempotency_key: &str) -> Result<i32, SendError> {
        let email = user.email.clone();
        let message = message.to_string();
        let idempotency_key = idempotency_key.to_string();

        let result = self
            .breaker
            .call(|| async move { self.send_with_retry(&email, &message, &idempotency_key).await })
            .await;

        match result {
            Ok(status) => {
                info!(user_id = %user.id, "message delivered");
                Ok(status)
            }
            Err(CircuitBreakerOutcome::Open) => Err(SendError::CircuitOpen),
            Err(CircuitBreakerOutcome::Inner(e)) => Err(SendError::Vendor(e)),
        }
    }

    async fn circuit_state(&self) -> circuit_breaker::CircuitState {
        self.breaker.state().await
    }
}

/// Test double that returns a pre-scripted outcome and records every call,
/// for worker pool tests that exercise send success/failure without a
/// vendor client.
#[cfg(test)]
pub struct ScriptedOutboundSender {
    outcome: std::sync::Mutex<Box<dyn Fn() -> Result<i32, SendError> + Send + Sync>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedOutboundSender {
    pub fn always_succeeds(vendor_status: i32) -> Self {
        Self {
            outcome: std::sync::Mutex::new(Box::new(move || Ok(vendor_status))),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn always_fails(body: &'static str) -> Self {
        Self {
            outcome: std::sync::Mutex::new(Box::new(move || {
                Err(SendError::Vendor(VendorError::Permanent {
                    status: reqwest::StatusCode::BAD_REQUEST,
                    body: body.to_string(),
                }))
            })),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl OutboundSender for ScriptedOutboundSender {
    async fn send(&self, _user: &User, _message: &str, _idempotency_key: &str) -> Result<i32, SendError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        (self.outcome.lock().unwrap())()
    }

    async fn circuit_state(&self) -> circuit_breaker::CircuitState {
        circuit_breaker::CircuitState::Closed
    }
}
