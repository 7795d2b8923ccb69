use thiserror::Error;

/// A single error type spanning every layer of the engine.
///
/// I/O and allocation failures are surfaced with their source error attached;
/// corrupt-image and unsupported-feature errors carry a message describing
/// what was wrong so a caller-supplied logger (or the CLI binaries) can
/// report useful context.
#[derive(Debug, Error)]
pub enum SquashfsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt image: {0}")]
    Corrupt(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("value overflows its on-disk encoding: {0}")]
    Overflow(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SquashfsError>;

impl SquashfsError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Self::Overflow(msg.into())
    }
}
