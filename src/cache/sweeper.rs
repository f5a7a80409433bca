//! Background sweeper: periodic idle purge and quota enforcement.
//!
//! Write-path eviction keeps the quota in steady state; the sweeper catches
//! entries that only age out (idle TTL) and quota drift from external changes.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::orchestrator::SharedCache;

/// Handle to a running sweeper. Dropping it also stops the sweeper.
pub struct SweeperHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for an in-progress pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }
}

/// Spawn a sweeper that runs every `interval`.
pub fn spawn(cache: SharedCache, interval: Duration) -> SweeperHandle {
    let (shutdown, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval_secs = interval.as_secs(), "Sweeper started");
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    match cache.sweep(Utc::now()).await {
                        Ok(report) => debug!(
                            purged = report.purged.len(),
                            evicted = report.eviction.evicted.len(),
                            remaining_bytes = report.eviction.remaining_bytes,
                            "Sweep complete"
                        ),
                        Err(e) => warn!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
        info!("Sweeper stopped");
    });

    SweeperHandle { shutdown, task }
}
