//! Database module - job store and dispatch queue backends
//!
//! - PostgreSQL: `jobs` and `dispatch_queue` tables shared by every API and
//!   worker process
//! - In-memory: single-process backends with the same contracts

mod in_memory;
mod intake;
mod jobs;
mod postgres;
mod queue;

pub use in_memory::{InMemoryJobStore, InMemoryQueue};
pub use intake::PgIntake;
pub use jobs::PgJobStore;
pub use postgres::{init_pool, migrations, PostgresPool};
pub use queue::PgDispatchQueue;
