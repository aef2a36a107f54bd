use thiserror::Error;

/// A convenience `Result` alias using [`KbaseError`].
pub type KbaseResult<T> = Result<T, KbaseError>;

/// Top-level error type for the kbase search engine.
///
/// Variants map onto how a failure is handled: `InvalidArgument` is surfaced
/// to the caller and never retried, `TransientIndex` is retried by the
/// embedding worker but surfaced once on the live search path.
#[derive(Error, Debug)]
pub enum KbaseError {
    /// A malformed request (unknown mode, zero limit, negative offset).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No embedding model is configured for this deployment.
    #[error("Embedding model unavailable")]
    ModelUnavailable,

    /// An index, model or storage call failed in a way that may succeed later.
    #[error("Transient index failure: {0}")]
    TransientIndex(String),

    /// A vector did not match the index's configured dimensionality.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the index was created with.
        expected: usize,
        /// Dimension of the rejected vector.
        actual: usize,
    },

    /// An error in the queue or vector persistence layer.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from an outbound HTTP request (embedding or language model API).
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KbaseError {
    /// Shorthand for building an [`KbaseError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Whether the embedding worker should put the item back for another attempt.
    ///
    /// Request-shape errors never heal on retry; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidArgument(_) | Self::Config(_))
    }
}
