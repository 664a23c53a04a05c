//! Submission/Status API
//!
//! `SubmissionService` holds the operations; `routes` exposes them over HTTP.

mod routes;
mod service;

pub use routes::{router, AppError, ExecuteResponse, StatusResponse};
pub use service::{suspicious_patterns, SubmissionService};
