#![forbid(unsafe_code)]
//! quern-core: shared foundation for the Quern worker memory subsystem.
//!
//! Holds the strongly-typed identifiers, the engine configuration, and the
//! core error type. The allocation machinery itself lives in `quern-mem`;
//! this crate stays dependency-light so any crate can use the IDs and config
//! without pulling the allocator.

pub mod config;
pub mod error;
pub mod id;
pub mod prelude;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use id::TaskId;
