/// PostgreSQL message store, schema helpers and pool construction.
pub mod postgres;
/// PostgreSQL lock service.
pub mod postgres_lock;

pub use postgres::{connect, ensure_schema, PostgresQueueStore};
pub use postgres_lock::PostgresLockService;
