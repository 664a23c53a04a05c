//! # Codexec
//!
//! Asynchronous execution of untrusted code snippets in locked-down sandboxes.
//!
//! ## Features
//!
//! - **Async Submission:** `POST /execute` returns a job id immediately; poll `GET /status/{id}`
//! - **At-Least-Once Dispatch:** Leased queue messages are redelivered when a worker dies
//! - **Isolated Execution:** One ephemeral container per job with CPU, memory, process,
//!   network and filesystem limits
//! - **Pluggable Storage:** PostgreSQL shared by many workers, or in-memory for one process

pub mod api;
pub mod config;
pub mod context;
pub mod core;
pub mod database;
pub mod error;
pub mod logging;
pub mod registry;
pub mod sandbox;
pub mod worker;

pub use config::Config;
pub use context::AppContext;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
