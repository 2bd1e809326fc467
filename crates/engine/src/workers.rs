//! Background work of one node: the scheduler pool and a loop that
//! releases scheduled campaigns when they come due.

use std::sync::Arc;

use mailflow_campaigns::CampaignBroadcaster;
use mailflow_scheduler::{JobScheduler, WorkerPool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct EngineWorkers {
    pool: WorkerPool,
    release: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl EngineWorkers {
    pub(crate) fn start(
        node_id: &str,
        workers: usize,
        scheduler: Arc<JobScheduler>,
        broadcaster: Arc<CampaignBroadcaster>,
    ) -> Self {
        let poll_interval = scheduler.settings().poll_interval;
        let mut pool = WorkerPool::new(node_id, scheduler);
        pool.start(workers);

        let (shutdown, mut stop) = watch::channel(false);
        let release = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let released = broadcaster.release_due();
                        if !released.is_empty() {
                            info!(campaigns = released.len(), "Released scheduled campaigns");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            pool,
            release,
            shutdown,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.release.await {
            error!(error = %e, "Campaign release loop panicked");
        }
        self.pool.shutdown().await;
    }
}
