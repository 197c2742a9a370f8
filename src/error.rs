//! Service-level error types and their rejection classification.
//!
//! Per-request errors are recovered at the request boundary and translated
//! into a response outcome by the transport layer. The [`Rejection`]
//! classes keep that mapping explicit: backpressure ("retry later") is
//! reported distinctly from input errors ("fix your request"), and no
//! error here ever touches shared state.

use thiserror::Error;

use crate::index::types::IndexError;
use crate::limits::semaphore::SemaphoreError;

/// Main error type for boundary operations.
#[derive(Error, Debug)]
pub enum BrowseError {
    /// Index failures: fatal shard/cache problems at startup, unknown IDs
    /// or keywords at request time.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// The client exhausted its hourly budget for this endpoint.
    #[error("rate limit exceeded for client '{key}'")]
    RateLimited { key: String },

    /// The client's concurrency queue is full.
    #[error(transparent)]
    Backpressure(#[from] SemaphoreError),

    /// A submitted feature vector was not valid base64.
    #[error("feature vector is not valid base64: {reason}\nSuggestion: submit the vector as standard base64 of little-endian f32 values")]
    FeatureNotBase64 { reason: String },

    /// A submitted feature vector decoded to the wrong byte length.
    #[error("feature vector has wrong length: expected {expected_bytes} bytes, got {actual_bytes}\nSuggestion: the vector must contain exactly dimension x 4 bytes")]
    FeatureWrongLength {
        expected_bytes: usize,
        actual_bytes: usize,
    },
}

/// Transport-level classification of a failed request.
///
/// The HTTP layer (out of scope here) maps these to status codes, e.g.
/// backpressure to 403 and the input classes to 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Malformed input; retrying the same request cannot succeed.
    BadRequest,
    /// The referenced ID or keyword does not exist.
    NotFound,
    /// Load shedding; the same request may succeed later.
    Backpressure,
}

impl BrowseError {
    /// Classifies this error for the transport layer.
    #[must_use]
    pub fn rejection(&self) -> Rejection {
        match self {
            Self::Index(IndexError::IdNotFound(_) | IndexError::KeywordNotFound(_)) => {
                Rejection::NotFound
            }
            Self::Index(_) => Rejection::BadRequest,
            Self::RateLimited { .. } | Self::Backpressure(_) => Rejection::Backpressure,
            Self::FeatureNotBase64 { .. } | Self::FeatureWrongLength { .. } => {
                Rejection::BadRequest
            }
        }
    }

    /// Stable identifier for programmatic error handling in JSON output.
    #[must_use]
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::Index(IndexError::IdNotFound(_)) => "ID_NOT_FOUND",
            Self::Index(IndexError::KeywordNotFound(_)) => "KEYWORD_NOT_FOUND",
            Self::Index(_) => "INDEX_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Backpressure(_) => "TOO_MANY_CONCURRENT_REQUESTS",
            Self::FeatureNotBase64 { .. } => "FEATURE_NOT_BASE64",
            Self::FeatureWrongLength { .. } => "FEATURE_WRONG_LENGTH",
        }
    }
}

/// Result type alias for boundary operations.
pub type BrowseResult<T> = Result<T, BrowseError>;
