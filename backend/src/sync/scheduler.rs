use super::{SyncClient, SyncOutcome, SyncState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Controls a spawned sync loop. Dropping it stops the loop as well.
pub struct SyncHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Stops the loop after the current pass and waits for it to exit.
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "sync loop ended abnormally");
        }
    }
}

/// Delay before the next attempt after `failures` consecutive failures.
pub(super) fn backoff(interval: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    interval.saturating_mul(factor).min(max)
}

impl SyncClient {
    /// Starts periodic sync: a health check first, then a pass every `interval`.
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let interval = self.options.interval;
            let max_backoff = self.options.max_backoff;
            let mut reachable = false;
            let mut failures = 0u32;
            tracing::info!(?interval, "sync loop started");

            loop {
                if !reachable {
                    reachable = self.health_check().await;
                    if !reachable && self.state() != SyncState::Disabled {
                        failures += 1;
                    }
                }
                if reachable {
                    match self.sync().await {
                        Ok(SyncOutcome::Completed(_)) | Ok(SyncOutcome::Skipped) => failures = 0,
                        Ok(SyncOutcome::Disabled) => {
                            reachable = false;
                            failures = 0;
                        }
                        Err(e) => {
                            failures += 1;
                            reachable = !e.is_transport();
                            tracing::warn!(error = %e, failures, "sync pass failed");
                        }
                    }
                }

                let delay = backoff(interval, max_backoff, failures);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped.changed() => break,
                }
            }
            tracing::info!("sync loop stopped");
        });
        SyncHandle { stop, task }
    }
}
