//! Service Module
//!
//! Business logic layer for the gateway.
//! Services sit between the HTTP handlers and the job store / task queue.

pub mod job;

// Re-export for convenience
pub use job as job_service;
