//! Background reclamation of idle job entries.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::registry::JobRegistry;

/// Handle to a running sweep task.
///
/// The task only reclaims memory; nothing depends on it running.
#[derive(Debug)]
pub struct SweepTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweepTask {
    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn a task that calls [`JobRegistry::sweep_idle`] every `interval`.
///
/// `interval` is clamped to `ttl`.
pub fn spawn_sweep_task(registry: JobRegistry, interval: Duration, ttl: Duration) -> SweepTask {
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let period = interval.min(ttl).max(Duration::from_millis(1));

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    registry.sweep_idle(ttl);
                }
            }
        }
        debug!("Job sweep task stopped");
    });

    SweepTask { shutdown, handle }
}
