//! Long-lived service abstraction and supervisor.
//!
//! Every cron loop, the worker pool, and the queue connection implement
//! `Service` so the supervisor can start, health-check, and shut them all
//! down uniformly in reverse dependency order.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[async_trait]
pub trait Service: Send + Sync {
    /// Short, stable name used in logs and health reporting.
    fn name(&self) -> &'static str;

    /// Run until `shutdown` is cancelled, then return. Implementations must
    /// treat cancellation as a request to wind down gracefully, not abort.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    Failed,
}

struct Registered {
    name: &'static str,
    state: Arc<RwLock<ServiceState>>,
}

/// Owns every long-lived component and coordinates shutdown.
///
/// Services are started in registration order and stopped in reverse order:
/// the last service registered is the first to receive the shutdown signal
/// and the last whose task is awaited.
#[derive(Default)]
pub struct Supervisor {
    services: Vec<Box<dyn Service>>,
    registered: Vec<Registered>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            registered: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: Box<dyn Service>) -> Self {
        self.registered.push(Registered {
            name: service.name(),
            state: Arc::new(RwLock::new(ServiceState::Stopped)),
        });
        self.services.push(service);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all registered services until a shutdown signal (SIGTERM/SIGINT)
    /// arrives, then wait for every service to drain.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let names: Vec<&'static str> = self.registered.iter().map(|r| r.name).collect();

        let mut handles = Vec::with_capacity(self.services.len());
        for (service, registered) in self.services.into_iter().zip(self.registered.into_iter()) {
            let token = shutdown.clone();
            let state = registered.state.clone();
            let name = registered.name;
            *state.write().await = ServiceState::Running;

            handles.push(tokio::spawn(async move {
                let result = service.run(token).await;
                match &result {
                    Ok(()) => {
                        info!(service = name, "service stopped cleanly");
                        *state.write().await = ServiceState::Stopped;
                    }
                    Err(e) => {
                        error!(service = name, error = %e, "service exited with error");
                        *state.write().await = ServiceState::Failed;
                    }
                }
                result
            }));
        }

        wait_for_shutdown_signal().await;
        info!(services = ?names, "shutdown signal received, stopping services");
        shutdown.cancel();

        for handle in handles.into_iter().rev() {
            if let Err(e) = handle.await {
                error!(error = %e, "service task panicked");
            }
        }

        Ok(())
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RunsUntilCancelled {
        name: &'static str,
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for RunsUntilCancelled {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_token_cancellation_is_observable_by_a_registered_service() {
        let ran = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let service = Box::new(RunsUntilCancelled {
            name: "test-service",
            ran: ran.clone(),
        });

        let child_token = token.clone();
        let handle = tokio::spawn(async move { service.run(child_token).await });

        tokio::task::yield_now().await;
        assert!(ran.load(Ordering::SeqCst));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn with_service_preserves_registration_order() {
        let supervisor = Supervisor::new()
            .with_service(Box::new(RunsUntilCancelled {
                name: "first",
                ran: Arc::new(AtomicBool::new(false)),
            }))
            .with_service(Box::new(RunsUntilCancelled {
                name: "second",
                ran: Arc::new(AtomicBool::new(false)),
            }));

        let names: Vec<&'static str> = supervisor.registered.iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
