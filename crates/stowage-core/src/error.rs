use crate::DeviceTier;

/// Errors raised by the stowage weight loading cache.
#[derive(Debug, thiserror::Error)]
pub enum StowageError {
    #[error("out of capacity on {tier}: requested {requested} bytes, {available} available")]
    OutOfCapacity {
        tier: DeviceTier,
        requested: usize,
        available: usize,
    },

    #[error("block {block} is already populated")]
    AlreadyPopulated { block: usize },

    #[error("block {block} holds parameters {found:?}, expected {expected:?}")]
    StructuralMismatch {
        block: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("block index {index} out of range ({len} slots)")]
    BlockOutOfRange { index: usize, len: usize },

    #[error("commit for block {block} lost {attempts} races in a row")]
    CommitContention { block: usize, attempts: usize },

    #[error("tier {0} is not configured")]
    UnknownTier(DeviceTier),

    #[error("invalid tier split: {0}")]
    InvalidSplit(String),

    #[error("stale or foreign buffer handle on {0}")]
    InvalidHandle(DeviceTier),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("duplicate parameter name '{0}'")]
    DuplicateParameter(String),

    #[error("block load cancelled")]
    Cancelled,

    #[error("prefetch failed for block {block}: {msg}")]
    Prefetch { block: usize, msg: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StowageError {
    /// Whether the error is a tier capacity failure that a caller may retry
    /// with a different tier split.
    pub fn is_capacity(&self) -> bool {
        matches!(self, StowageError::OutOfCapacity { .. })
    }
}
