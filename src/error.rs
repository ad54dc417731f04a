use thiserror::Error;

/// Error taxonomy for the diff core.
#[derive(Debug, Error)]
pub enum DiffError {
    /// Program representation malformed or missing. Fatal for the current
    /// pair; the batch runner reports it and moves on.
    #[error("failed to load program: {0}")]
    Load(String),

    /// Configuration missing required keys or referencing unknown steps.
    /// Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Resource exhaustion while diffing one pair. The worker abandons the
    /// pair, clears its caches and proceeds.
    #[error("resource limit exceeded: {0}")]
    Resource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiffError>;
