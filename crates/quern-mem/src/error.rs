use thiserror::Error;

/// Result type local to quern-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Process or task limit exceeded, injected fault, or the raw source
    /// refused the request. The only failure kind this engine surfaces.
    #[error("memory allocation failed: {0}")]
    AllocFailed(String),
}
