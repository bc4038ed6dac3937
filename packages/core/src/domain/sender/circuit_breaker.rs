//! Circuit breaker guarding the outbound vendor call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Ring buffer of the most recent `min_calls_in_window` call outcomes
/// (`true` = error). A genuine sliding window: each new call evicts the
/// oldest outcome rather than the window being cleared on evaluation, so a
/// sustained error rate straddling any particular call still shows up in the
/// error rate the moment the window fills.
struct Window {
    outcomes: VecDeque<bool>,
    errors: u32,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            errors: 0,
            capacity,
        }
    }

    fn record(&mut self, is_error: bool) {
        if self.outcomes.len() == self.capacity {
            if self.outcomes.pop_front() == Some(true) {
                self.errors -= 1;
            }
        }
        self.outcomes.push_back(is_error);
        if is_error {
            self.errors += 1;
        }
    }

    fn is_full(&self) -> bool {
        self.outcomes.len() >= self.capacity
    }

    fn error_rate(&self) -> f64 {
        self.errors as f64 / self.outcomes.len() as f64
    }

    fn reset(&mut self) {
        self.outcomes.clear();
        self.errors = 0;
    }
}

/// Trips open once `min_calls_in_window` calls have been observed and the
/// error rate crosses `error_rate_threshold`. Half-open admits a single
/// probe call; success closes the circuit, failure re-opens it.
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    window: RwLock<Window>,
    last_opened: RwLock<Option<Instant>>,
    half_open_probe_in_flight: RwLock<bool>,
    min_calls_in_window: u32,
    error_rate_threshold: f64,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(min_calls_in_window: u32, error_rate_threshold: f64, open_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(CircuitState::Closed),
            window: RwLock::new(Window::new(min_calls_in_window as usize)),
            last_opened: RwLock::new(None),
            half_open_probe_in_flight: RwLock::new(false),
            min_calls_in_window,
            error_rate_threshold,
            open_duration,
        })
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Run `operation` under circuit-breaker protection. Returns
    /// `Err(CircuitOpenError)` without invoking `operation` when open.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerOutcome<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        {
            let state = *self.state.read().await;
            if state == CircuitState::Open {
                let elapsed = self
                    .last_opened
                    .read()
                    .await
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.open_duration {
                    *self.state.write().await = CircuitState::HalfOpen;
                } else {
                    return Err(CircuitBreakerOutcome::Open);
                }
            }

            if *self.state.read().await == CircuitState::HalfOpen {
                let mut probe = self.half_open_probe_in_flight.write().await;
                if *probe {
                    return Err(CircuitBreakerOutcome::Open);
                }
                *probe = true;
            }
        }

        let result = operation().await;
        self.record(result.is_ok()).await;
        result.map_err(CircuitBreakerOutcome::Inner)
    }

    async fn record(&self, success: bool) {
        let state = *self.state.read().await;

        if state == CircuitState::HalfOpen {
            *self.half_open_probe_in_flight.write().await = false;
            if success {
                *self.state.write().await = CircuitState::Closed;
                self.window.write().await.reset();
            } else {
                *self.state.write().await = CircuitState::Open;
                *self.last_opened.write().await = Some(Instant::now());
            }
            return;
        }

        let mut window = self.window.write().await;
        window.record(!success);

        if window.is_full() && window.error_rate() >= self.error_rate_threshold {
            drop(window);
            *self.state.write().await = CircuitState::Open;
            *self.last_opened.write().await = Some(Instant::now());
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitBreakerOutcome<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Inner(E),
}
