//! Type-safe wrappers and error types for the embedding index.
//!
//! Newtypes here prevent primitive obsession at the index boundary:
//! catalog item IDs and vector dimensions each get their own type with
//! validation at the point of construction.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Identifier of a catalog item, parallel to one row of the feature matrix.
///
/// IDs are opaque strings assigned by the upstream catalog; uniqueness is
/// assumed, not enforced here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Creates a new `ProductId` from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProductId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProductId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Type-safe wrapper for vector dimensions.
///
/// Every vector entering the index is validated against the store's
/// dimension, so a mismatched embedding model fails loudly instead of
/// producing garbage distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, IndexError> {
        if dim == 0 {
            return Err(IndexError::InvalidDimension {
                dimension: 0,
                reason: "vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.0 {
            return Err(IndexError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for VectorDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur while loading or querying the embedding index.
///
/// Startup variants (shard and cache errors) are fatal: the process must
/// not begin serving with a partial index. Lookup variants are per-request
/// and map to client rejections.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to read shard '{path}': {source}\nSuggestion: check that the feature directory is complete and readable")]
    ShardRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("shard '{path}' is corrupt: {reason}\nSuggestion: regenerate the feature shards from the exporter")]
    ShardFormat { path: PathBuf, reason: String },

    #[error("feature directory '{dir}' is missing shard {index}\nSuggestion: shards must be numbered contiguously from 0")]
    MissingShard { dir: PathBuf, index: usize },

    #[error("no feature shards found in '{dir}'\nSuggestion: point feature_dir at the exported shard directory")]
    NoShards { dir: PathBuf },

    #[error("vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: ensure all vectors come from the same embedding model")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error("invalid center count {center_count} for {vector_count} vectors\nSuggestion: use center counts between 1 and the vector count")]
    InvalidCenterCount {
        center_count: usize,
        vector_count: usize,
    },

    #[error("failed to write cluster cache '{path}': {source}\nSuggestion: check disk space and directory permissions")]
    CacheWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to load cluster cache '{path}': {reason}\nSuggestion: delete the cache file to force recomputation")]
    CacheLoad { path: PathBuf, reason: String },

    #[error("id '{0}' not found in the index")]
    IdNotFound(ProductId),

    #[error("keyword '{0}' has no prototype vector")]
    KeywordNotFound(String),
}

/// Result type alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;
