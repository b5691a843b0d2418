/// Retry and backoff policy for failed handlers.
pub mod retry;
/// Worker loop, worker pool and shutdown signalling.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use retry::{RetryDecision, RetryPolicy};
pub use supervisor::{ProcessOutcome, ShutdownToken, Worker, WorkerPool};
pub use worker::WorkerConfig;
