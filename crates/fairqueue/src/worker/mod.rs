//! Job execution
//!
//! This module provides:
//! - [`HandlerRegistry`] - job_type to handler map, built once at startup
//! - [`Worker`] - poll, claim, execute and record outcomes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Worker                            │
//! │   for each queue:                                         │
//! │     queue_depth ──► metrics                               │
//! │     claim (one transaction, leases committed)             │
//! │     for each job: handler ──► complete | fail             │
//! │   empty pass ──► sleep(poll_interval) or shutdown         │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod registry;
mod runner;

pub use registry::{HandlerError, HandlerRegistry, HandlerResult, JobHandler};
pub use runner::{Worker, WorkerError};
