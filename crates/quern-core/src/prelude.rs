//! Convenient re-exports for downstream crates.

pub use crate::config::EngineConfig;
pub use crate::error::{Error, Result};
pub use crate::id::TaskId;
