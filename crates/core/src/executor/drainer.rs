//! Periodic sweep of the background tiers
//!
//! Low and Batch requests are normally only forced through at their
//! (long) deadline. The drainer executes them on a fixed cadence so they
//! make progress even when no new submissions arrive. Each tick also
//! purges expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::executor::batch::BatchExecutor;
use crate::queue::PriorityQueueSet;
use crate::request::Priority;

/// Drain each background tier once, up to its batch size
///
/// Returns the number of requests executed.
pub async fn sweep_background_tiers(queues: &PriorityQueueSet, executor: &BatchExecutor) -> usize {
    let mut executed = 0;
    for priority in Priority::BACKGROUND {
        let batch = queues.drain(priority, queues.policy(priority).max_batch_size);
        if batch.is_empty() {
            continue;
        }
        executed += batch.len();
        tracing::debug!(%priority, size = batch.len(), "Background drain");
        executor.execute_batch(batch, Some(Uuid::new_v4())).await;
    }
    executed
}

/// Handle to the running background task
pub struct BackgroundDrainer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BackgroundDrainer {
    /// Spawn the drain loop on the current runtime
    ///
    /// The first sweep happens one `interval` after start.
    pub fn start(
        queues: Arc<PriorityQueueSet>,
        executor: Arc<BatchExecutor>,
        cache: Arc<ResponseCache>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_ms = interval.as_millis() as u64, "Background drainer started");

            loop {
                tokio::select! {
                    // Stop requested or the handle was dropped
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let executed = sweep_background_tiers(&queues, &executor).await;
                        let purged = cache.purge_expired();
                        if executed > 0 || purged > 0 {
                            tracing::debug!(executed, purged, "Background drain cycle complete");
                        }
                    }
                }
            }

            tracing::info!("Background drainer stopped");
        });

        Self { shutdown, task }
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop after any in-progress sweep finishes
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Background drainer task failed: {}", e);
        }
    }
}
