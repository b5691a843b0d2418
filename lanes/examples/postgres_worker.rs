//! PostgreSQL worker example: one partition per environment, several runs
//! driven through every phase by a pool of workers.
//!
//! # Prerequisites
//!
//! 1. PostgreSQL server running locally or accessible via network
//! 2. Database created: `createdb lanes_example`
//!
//! # Running the Example
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/lanes_example"
//! RUST_LOG=lanes=debug,postgres_worker=info \
//!     cargo run --example postgres_worker --features postgres
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lanes::persistence::{connect, ensure_schema, PostgresLockService};
use lanes::*;
use lanes_testkit::InMemoryRunRepository;
use tracing_subscriber::EnvFilter;

/// Executor that pretends to work for a while, refreshing its locks.
struct SleepyExecutor;

#[async_trait]
impl PhaseExecutor for SleepyExecutor {
    async fn execute(
        &self,
        phase: Phase,
        run: &Run,
        refresher: &dyn LockRefresher,
    ) -> anyhow::Result<PhaseOutcome> {
        tracing::info!(run_id = run.id, environment_id = run.environment_id, phase = %phase, "working");
        tokio::time::sleep(Duration::from_millis(150)).await;
        refresher.refresh().await?;
        refresher.heartbeat().await?;
        Ok(PhaseOutcome::Succeeded)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let persistence = PersistenceConfig::from_env()?;
    let pool = connect(&persistence).await?;
    let transport_config = TransportConfig::from_dsn("per-partition://default")?;
    ensure_schema(&pool, &transport_config.table_name).await?;

    let lock_service: Arc<dyn LockService> = Arc::new(PostgresLockService::new(pool.clone()));
    let factory = TransportFactory::new(StoreBackend::Postgres(pool.clone()), lock_service.clone());
    let transport = factory.create("per-partition://default")?;

    let runs = InMemoryRunRepository::new();
    for (run_id, environment_id) in [(1, 1), (2, 1), (3, 2), (4, 3)] {
        runs.insert(run_id, environment_id, RunStatus::Running);
        transport
            .bus()
            .dispatch_message(RunPhaseMessage::new(run_id, environment_id, Phase::Prepare).into())
            .await?;
    }

    let handler = RunPhaseHandler::new(
        Arc::new(runs),
        Arc::new(SleepyExecutor),
        RunLocks::new(lock_service, RunLockConfig::default()),
        Arc::new(transport.bus()),
    );
    let router = Arc::new(MessageRouter::new().with_handler(Arc::new(handler)));

    let workers = (0..3)
        .map(|i| {
            Worker::new(
                transport.clone(),
                router.clone(),
                RetryPolicy::default(),
                WorkerConfig::new(format!("worker-{i}")).with_poll_interval(100),
            )
        })
        .collect();
    let pool_handle = WorkerPool::spawn(workers, None);

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = transport.snapshot().await?;
        tracing::info!(remaining = snapshot.total(), "queue depth");
        if snapshot.total() == 0 {
            break;
        }
    }

    pool_handle.shutdown().await;
    Ok(())
}
