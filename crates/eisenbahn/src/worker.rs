//! Long-running worker lifecycle.
//!
//! A [`Worker`] owns its background tasks and reports its own health.
//! [`WorkerRunner`] starts it, samples [`Worker::status`] into a
//! `worker.health` ping on every tick, and stops it within a bounded time
//! once an OS signal or the caller's `Notify` asks for shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use rentflow_core::config::WorkerSettings;

use crate::error::EisenbahnError;
use crate::message::Message;
use crate::messages::events::{WorkerHealth, WorkerStatus};
use crate::messages::PipelineEvent;
use crate::traits::EventPublisher;

#[async_trait]
pub trait Worker: Send + Sync {
    /// Spawn background tasks. Called once.
    async fn start(&self) -> Result<(), EisenbahnError>;

    /// Stop background tasks and wait for them. Called once.
    async fn stop(&self) -> Result<(), EisenbahnError>;

    fn name(&self) -> &str;

    /// Health as the worker sees it right now. Sampled once per ping.
    fn status(&self) -> WorkerStatus {
        WorkerStatus::Healthy
    }
}

pub struct WorkerRunner {
    worker: Arc<dyn Worker>,
    publisher: Arc<dyn EventPublisher>,
    health_interval: Duration,
    shutdown_timeout: Duration,
}

impl WorkerRunner {
    pub fn new(
        worker: Arc<dyn Worker>,
        publisher: Arc<dyn EventPublisher>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            worker,
            publisher,
            health_interval: Duration::from_secs(settings.health_interval_secs.max(1)),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
        }
    }

    /// Start the worker and ping until an OS signal or `shutdown` fires.
    pub async fn run(&self, shutdown: Option<Arc<Notify>>) -> Result<(), EisenbahnError> {
        self.run_until(Self::shutdown_requested(shutdown)).await
    }

    async fn run_until(&self, stop: impl Future<Output = ()>) -> Result<(), EisenbahnError> {
        let name = self.worker.name().to_string();
        let started_at = Instant::now();

        self.worker.start().await?;
        info!(worker = %name, health_interval = ?self.health_interval, "worker started");

        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(self.health_interval);
        let mut last = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.worker.status();
                    if last.is_some_and(|previous| previous != status) {
                        info!(worker = %name, ?status, "worker status changed");
                    }
                    last = Some(status);
                    self.ping(status, started_at).await;
                }
                _ = &mut stop => break,
            }
        }

        info!(worker = %name, timeout = ?self.shutdown_timeout, "stopping worker");
        match tokio::time::timeout(self.shutdown_timeout, self.worker.stop()).await {
            Ok(Ok(())) => info!(worker = %name, "worker stopped"),
            Ok(Err(e)) => warn!(worker = %name, error = %e, "worker stop failed"),
            Err(_) => warn!(worker = %name, "worker stop timed out"),
        }
        self.ping(WorkerStatus::Unhealthy, started_at).await;
        Ok(())
    }

    async fn ping(&self, status: WorkerStatus, started_at: Instant) {
        let health = PipelineEvent::WorkerHealth(WorkerHealth {
            worker_id: self.worker.name().to_string(),
            status,
            uptime_secs: started_at.elapsed().as_secs(),
        });
        if let Err(e) = self.publisher.publish(Message::new(health)).await {
            warn!(worker = %self.worker.name(), error = %e, "health ping not published");
        }
    }

    async fn shutdown_requested(notify: Option<Arc<Notify>>) {
        match notify {
            Some(notify) => {
                tokio::select! {
                    _ = os_signal() => {}
                    _ = notify.notified() => {}
                }
            }
            None => os_signal().await,
        }
    }
}

/// SIGINT or SIGTERM on Unix, Ctrl+C elsewhere. Never resolves if the
/// handlers cannot be installed.
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
}
