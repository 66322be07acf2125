//! Docprobe Store
//!
//! Persistence shared by the gateway and the worker:
//! - [`kv`]: the keyed store with TTLs (Postgres and in-memory)
//! - [`job_store`]: job records, leases and cancellation flags on top of it
//! - [`task`]: at-least-once task dispatch
//! - [`db`]: pool creation and schema migrations

pub mod db;
pub mod error;
pub mod job_store;
pub mod kv;
pub mod task;

pub use error::StoreError;
pub use job_store::JobStore;
pub use kv::{KeyedStore, MemoryStore, PgStore};
pub use task::{ClaimedTask, MemoryTaskQueue, PgTaskQueue, TaskQueue, TaskRecord, TaskStatus};
