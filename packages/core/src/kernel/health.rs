//! In-process health aggregation. The core only computes this; binding it
//! to an HTTP probe is left to the (out-of-scope) API surface.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::RwLock;

use crate::domain::sender::circuit_breaker::CircuitState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Down,
}

#[derive(Debug, Clone)]
pub struct LoopStatus {
    pub last_run: Option<SystemTime>,
    pub healthy: bool,
    pub error_count: u64,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            last_run: None,
            healthy: true,
            error_count: 0,
        }
    }
}

#[derive(Default)]
pub struct HealthSnapshot {
    loops: RwLock<std::collections::HashMap<&'static str, LoopStatus>>,
}

impl HealthSnapshot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn record_loop_success(&self, name: &'static str) {
        let mut loops = self.loops.write().await;
        let status = loops.entry(name).or_default();
        status.last_run = Some(SystemTime::now());
        status.healthy = true;
    }

    pub async fn record_loop_error(&self, name: &'static str) {
        let mut loops = self.loops.write().await;
        let status = loops.entry(name).or_default();
        status.last_run = Some(SystemTime::now());
        status.healthy = false;
        status.error_count += 1;
    }

    /// Healthy if every loop is healthy and the circuit breaker is closed;
    /// degraded if the breaker has tripped or a loop is erroring but others
    /// are still making progress; down if every loop has gone unhealthy.
    pub async fn overall(&self, breaker_state: CircuitState) -> HealthState {
        let loops = self.loops.read().await;
        if loops.is_empty() {
            return HealthState::Healthy;
        }

        let unhealthy = loops.values().filter(|s| !s.healthy).count();
        if unhealthy == loops.len() {
            return HealthState::Down;
        }
        if unhealthy > 0 || breaker_state != CircuitState::Closed {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthy_with_no_loops_registered_yet() {
        let snapshot = HealthSnapshot::new();
        assert_eq!(snapshot.overall(CircuitState::Closed).await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn degraded_when_one_loop_errors_but_others_are_fine() {
        let snapshot = HealthSnapshot::new();
        snapshot.record_loop_success("minute-enqueuer").await;
        snapshot.record_loop_error("daily-materializer").await;

        assert_eq!(snapshot.overall(CircuitState::Closed).await, HealthState::Degraded);
    }

    #[tokio::test]
    async fn down_when_every_loop_is_unhealthy() {
        let snapshot = HealthSnapshot::new();
        snapshot.record_loop_error("minute-enqueuer").await;
        snapshot.record_loop_error("daily-materializer").await;

        assert_eq!(snapshot.overall(CircuitState::Closed).await, HealthState::Down);
    }

    #[tokio::test]
    async fn degraded_when_circuit_breaker_is_open_even_if_loops_are_healthy() {
        let snapshot = HealthSnapshot::new();
        snapshot.record_loop_success("minute-enqueuer").await;

        assert_eq!(snapshot.overall(CircuitState::Open).await, HealthState::Degraded);
    }
}
