//! Data Transfer Objects
//!
//! Shapes exchanged between the gateway, the worker and the CLI. Domain types
//! are projected into these before they leave a service.

pub mod job;
pub mod task;
