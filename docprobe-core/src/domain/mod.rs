//! Core domain types
//!
//! The job aggregate and everything it owns. These types are persisted as a
//! single JSON document per job by the store and mutated only by the worker
//! that holds the job lease.

pub mod error;
pub mod execution;
pub mod job;
pub mod report;
pub mod use_case;
