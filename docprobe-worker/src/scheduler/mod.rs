//! Scheduler layer for the worker
//!
//! This layer claims analysis tasks from the task queue and hands each job
//! to the orchestrator. It keeps the claims alive while jobs run and decides
//! from the outcome whether a task is acknowledged or redelivered. A
//! sweeper purges expired entries from the keyed store alongside it.

pub mod poller;
pub mod sweeper;

pub use poller::TaskPoller;
pub use sweeper::ExpirySweeper;
