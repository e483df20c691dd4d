use thiserror::Error;

/// Error type for buffer, pool and persistent heap operations.
#[derive(Error, Debug)]
pub enum BufferError {
    /// An element index outside `[0, size)` was requested.
    #[error("Index out of range: index={index}, size={size}")]
    IndexOutOfRange { index: usize, size: usize },

    /// The pool could not supply the requested chunks.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The list was used after it was released, or its series is already held.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        region: Option<u64>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for BufferError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BufferError::LockError(format!("Mutex poisoned: {}", err))
    }
}

impl From<config::ConfigError> for BufferError {
    fn from(err: config::ConfigError) -> Self {
        BufferError::ConfigError(err.to_string())
    }
}

impl BufferError {
    pub(crate) fn corruption(details: impl Into<String>, region: Option<u64>) -> Self {
        BufferError::Corruption {
            details: details.into(),
            region,
        }
    }
}
