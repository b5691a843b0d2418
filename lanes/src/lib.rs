//! Lanes - per-partition ordered message queue with a multi-phase run worker.
//!
//! Messages are stored in a relational table and partitioned by `queue_name`,
//! one partition per test environment. Within a partition delivery is strictly
//! FIFO and never overlaps; across partitions any number of workers run in
//! parallel. A non-blocking partition lock guards each claim.
//!
//! # Core Concepts
//!
//! - **Store**: The [`QueueStore`] trait abstracts the message table, with an
//!   in-memory implementation and a PostgreSQL one behind the `postgres` feature.
//!
//! - **Locks**: [`LockService`] provides expiring, non-blocking named locks.
//!   [`PartitionLocks`] and [`RunLocks`] derive keys and TTLs from configuration.
//!
//! - **Transport**: [`PartitionReceiver`] claims one message per free partition,
//!   [`PartitionSender`] writes them, and [`TransportFactory`] builds both from a
//!   `per-partition://` DSN.
//!
//! - **Bus**: [`TransportBus`] runs [`Middleware`] such as
//!   [`PartitionRoutingMiddleware`] before sending.
//!
//! - **Handlers**: [`RunPhaseHandler`] drives prepare → execute → report →
//!   notify → cleanup, one message per phase. [`CronJobHandler`] and
//!   [`ScheduledSuiteHandler`] serve the schedule.
//!
//! - **Schedule**: [`ScheduleProvider`]s feed a [`ScheduleRunner`] that
//!   dispatches cron-driven messages.
//!
//! - **Runtime**: [`Worker`] and [`WorkerPool`] poll, dispatch to handlers, and
//!   apply the [`RetryPolicy`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL store and lock service via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use lanes::*;
//!
//! let factory = TransportFactory::new(
//!     StoreBackend::InMemory(InMemoryQueueStore::new()),
//!     Arc::new(InMemoryLockService::new()),
//! );
//! let transport = factory.create("per-partition://default")?;
//! transport
//!     .bus()
//!     .dispatch_message(RunPhaseMessage::new(run_id, environment_id, Phase::Prepare).into())
//!     .await?;
//! ```

/// Outgoing message bus and middleware.
///
/// Provides the [`MessageBus`] trait, [`TransportBus`] and
/// [`PartitionRoutingMiddleware`].
pub mod bus;

/// Configuration structures for persistence, transport, run locks and schedules.
pub mod config;

/// Entities and repository traits consumed by the handlers.
pub mod domain;

/// Messages with their transport stamps.
pub mod envelope;

/// Message handlers and routing.
///
/// - [`RunPhaseHandler`] - the multi-phase run workflow
/// - [`CronJobHandler`] - configured cron jobs
/// - [`ScheduledSuiteHandler`] - scheduled suite fan-out
/// - [`MessageRouter`] - dispatch by message type
/// - [`HandlerError`] - retryable and fatal failures
pub mod handler;

/// Expiring non-blocking locks.
///
/// - [`LockService`] and [`InMemoryLockService`]
/// - [`PartitionLocks`] and [`RunLocks`] key derivation
/// - [`LockRefresher`] capability for long-running work
/// - [`clear_partition_locks`] administration
pub mod lock;

/// Domain message shapes and the run [`Phase`] state machine.
pub mod message;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// Provides [`persistence::PostgresQueueStore`] and
/// [`persistence::PostgresLockService`] when the `postgres` feature is enabled.
pub mod persistence;

/// Per-partition receiver and claim tickets.
pub mod receiver;

/// Worker runtime.
///
/// - [`Worker`] - poll, handle, ack or retry
/// - [`WorkerPool`] - spawned workers plus schedule runner
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`RetryPolicy`] - backoff and dead-lettering
/// - [`WorkerConfig`] - individual worker configuration
pub mod runtime;

/// Cron schedules, providers and the schedule runner.
pub mod schedule;

/// Per-partition sender.
pub mod sender;

/// Envelope encoding.
pub mod serializer;

/// Durable message storage.
///
/// Defines [`QueueStore`], [`InMemoryQueueStore`] and [`QueueSnapshot`].
pub mod store;

/// Tracing spans and telemetry helpers.
pub mod telemetry;

/// Transport factory combining receiver, sender and bus.
pub mod transport;

pub use bus::*;
pub use config::*;
pub use domain::*;
pub use envelope::*;
pub use handler::*;
pub use lock::*;
pub use message::*;
pub use receiver::*;
pub use runtime::*;
pub use schedule::*;
pub use sender::*;
pub use serializer::*;
pub use store::*;
pub use transport::*;
