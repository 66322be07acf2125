//! Docprobe Worker
//!
//! Claims analysis tasks and drives each job through its phases:
//! clone the repository, extract use cases in a sandbox, execute every use
//! case in its own sandbox through a bounded pool, and write the quality
//! report.
//!
//! Layers:
//! - [`scheduler`]: task claiming and acknowledgement
//! - [`orchestrator`]: the per-job phase machine, lease and cancellation
//! - [`pool`]: bounded parallel execution of use cases
//! - [`sandbox`] / [`container`]: the isolated execution environment

pub mod config;
pub mod container;
pub mod extraction;
pub mod git;
pub mod layout;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod sandbox;
pub mod scheduler;
pub mod shutdown;
