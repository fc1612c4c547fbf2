#![forbid(unsafe_code)]
//! Facade over the Quern worker memory subsystem.
//!
//! Re-exports the pieces most callers need; the full surface lives in
//! `quern-core` and `quern-mem`.

pub use quern_core::config::EngineConfig;
pub use quern_core::id::TaskId;
pub use quern_mem::{
    attach_task, AlignedBuf, Allocator, MemTracker, MemoryArbitrator, MemoryEnv, TaskState,
};
