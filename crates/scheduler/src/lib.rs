//! Job scheduler: claims due jobs, dispatches them and applies the retry
//! policy. Runs as a pool of poll loops per node.

pub mod retry;
pub mod scheduler;
pub mod worker;

pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{JobOutcome, JobScheduler, SchedulerSettings, TickSummary};
pub use worker::{SchedulerWorker, WorkerPool};
