//! quern-mem: memory-accounting allocation engine for Quern workers.
//!
//! Wraps raw memory acquisition with per-task accounting, hard-limit
//! admission against a process-wide arbitrator, fault injection for tests,
//! and a bounded wait for reclamation under pressure. Every large buffer in
//! the engine should flow through [`Allocator`] so the limits actually hold.
//!
//! The raw sources in `source::` are the only modules that touch raw
//! pointers; everything above them is safe code.

pub mod allocator;
pub mod arbitrator;
pub mod buffer;
pub mod context;
pub mod error;
pub mod source;
pub mod tracker;

pub use allocator::{Allocator, MemoryEnv};
pub use arbitrator::MemoryArbitrator;
pub use buffer::AlignedBuf;
pub use context::{attach_task, AttachGuard, SkipCheckGuard, TaskState};
pub use error::{Error, Result};
pub use source::{HeapMemory, MappedMemory, RawMemory, RecordingMemory};
pub use tracker::{MemTracker, RegionInstrumentation};
