//! Periodic reclamation of expired job leases.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::queue::{JobQueue, QueueError};

/// Makes jobs whose worker died (or stalled past its lease) visible again.
pub struct LeaseReaper {
    queue: Arc<dyn JobQueue>,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self::with_interval(queue, Duration::from_secs(30))
    }

    pub fn with_interval(queue: Arc<dyn JobQueue>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Tick until `shutdown` flips to true (or its sender goes away).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.interval, "lease reaper started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.reap_once().await {
                Ok(0) => debug!("no expired leases"),
                Ok(reclaimed) => info!(reclaimed, "reclaimed expired leases"),
                Err(e) => warn!(error = %e, "lease reaping failed"),
            }
        }

        info!("lease reaper stopped");
    }

    /// One reclamation pass.
    pub async fn reap_once(&self) -> Result<usize, QueueError> {
        self.queue.reclaim_expired().await
    }
}
