//! Scheduler workers: N poll loops per node sharing one `JobScheduler`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::scheduler::JobScheduler;

/// A single poll loop.
pub struct SchedulerWorker {
    pub worker_id: String,
    scheduler: Arc<JobScheduler>,
}

impl SchedulerWorker {
    pub fn new(worker_id: String, scheduler: Arc<JobScheduler>) -> Self {
        Self {
            worker_id,
            scheduler,
        }
    }

    /// Spawn the loop. It stops after the tick in progress once `shutdown`
    /// flips to `true`.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let poll_interval = self.scheduler.settings().poll_interval;
            info!(
                worker_id = %self.worker_id,
                poll_interval_ms = poll_interval.as_millis() as u64,
                "Scheduler worker started"
            );

            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.poll_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(worker_id = %self.worker_id, "Scheduler worker stopped");
        })
    }

    async fn poll_once(&self) {
        match self.scheduler.recover_stale_claims() {
            Ok(0) => {}
            Ok(recovered) => info!(worker_id = %self.worker_id, recovered, "Stale claims recovered"),
            Err(e) => warn!(worker_id = %self.worker_id, error = %e, "Stale claim recovery failed"),
        }
        let summary = self.scheduler.tick().await;
        metrics::histogram!("scheduler.tick_due").record(summary.due as f64);
    }
}

/// Spawns and supervises the scheduler workers of one node.
pub struct WorkerPool {
    node_id: String,
    scheduler: Arc<JobScheduler>,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(node_id: impl Into<String>, scheduler: Arc<JobScheduler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            node_id: node_id.into(),
            scheduler,
            handles: Vec::new(),
            shutdown,
        }
    }

    pub fn start(&mut self, workers: usize) {
        for i in 0..workers {
            let worker_id = format!("{}-worker-{:02}", self.node_id, self.handles.len());
            let worker = SchedulerWorker::new(worker_id.clone(), self.scheduler.clone());
            self.handles.push(worker.spawn(self.shutdown.subscribe()));
            info!(worker_id = %worker_id, index = i, "Worker spawned");
        }
        info!(
            count = self.handles.len(),
            node = %self.node_id,
            "All scheduler workers started"
        );
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every worker and wait for the loops to exit.
    pub async fn shutdown(mut self) {
        // Send only fails when every worker is already gone.
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler worker panicked");
            }
        }
        info!(node = %self.node_id, "Scheduler workers shut down");
    }
}
