//! Core module - Fundamental traits and types
//!
//! - `types`: the Job record and its status machine
//! - `store`: the `JobStore` persistence trait
//! - `queue`: the `DispatchQueue` trait and `Lease`
//! - `intake`: admission of new jobs onto the store and queue
//!
//! Backends in `crate::database` implement the traits; the API and the worker
//! only ever see trait objects.

pub mod intake;
pub mod queue;
pub mod store;
pub mod types;

pub use intake::{Intake, StagedIntake, INTAKE_WRITER};
pub use queue::{DispatchQueue, Lease};
pub use store::JobStore;
pub use types::*;
