//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`JobStore`] trait for job and dead-letter persistence
//! - [`InMemoryJobStore`] for testing
//! - [`PostgresJobStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{ClaimRequest, DeadLetterFilter, JobStore, Pagination, StoreError};
