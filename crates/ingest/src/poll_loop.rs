use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use rentflow_core::config::PollerConfig;
use rentflow_core::Backoff;

use crate::error::PollError;
use crate::poller::Poller;

/// Drives [`Poller::poll_once`] on an interval.
///
/// A failed cycle waits out a capped exponential backoff instead of the
/// interval. After `max_consecutive_failures` failures in a row the loop
/// gives up with [`PollError::CircuitOpen`].
pub struct PollLoop {
    poller: Arc<Poller>,
    interval: Duration,
    backoff: Backoff,
    max_consecutive_failures: u32,
    failures: Arc<AtomicU32>,
}

impl PollLoop {
    pub fn new(poller: Arc<Poller>, config: &PollerConfig) -> Self {
        Self {
            poller,
            interval: config.interval(),
            backoff: config.backoff(),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Publish the current run of failed cycles into `gauge`.
    pub fn with_failure_gauge(mut self, gauge: Arc<AtomicU32>) -> Self {
        self.failures = gauge;
        self
    }

    /// Failed cycles since the last successful one.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), PollError> {
        let source = self.poller.source_name().to_string();
        info!(source = %source, interval = ?self.interval, "poll loop started");
        let mut failures: u32 = 0;
        self.failures.store(0, Ordering::Relaxed);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.poller.poll_once().await {
                Ok(_) => {
                    if failures > 0 {
                        info!(source = %source, after = failures, "poll recovered");
                    }
                    failures = 0;
                    self.failures.store(0, Ordering::Relaxed);
                    self.interval
                }
                Err(e) => {
                    failures += 1;
                    self.failures.store(failures, Ordering::Relaxed);
                    if failures >= self.max_consecutive_failures {
                        error!(source = %source, failures, error = %e, "poll circuit open, halting");
                        return Err(PollError::CircuitOpen {
                            failures,
                            last: e.to_string(),
                        });
                    }
                    let delay = self.backoff.delay(failures);
                    warn!(source = %source, failures, retry_in = ?delay, error = %e, "poll cycle failed");
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(source = %source, "poll loop stopped");
        Ok(())
    }
}
