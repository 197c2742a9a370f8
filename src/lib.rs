//! Visual-similarity retrieval core: embedding index plus request
//! admission for a product-browsing service.

pub mod config;
pub mod error;
pub mod index;
pub mod limits;
pub mod service;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{BrowseError, BrowseResult, Rejection};
pub use index::{
    FeatureStore, IndexError, IndexResult, NeighborMap, ProductId, QueryOptions, VectorDimension,
};
pub use limits::{KeyedSemaphore, Permit, RateLimiter, SemaphoreError};
pub use service::{BrowseService, PrototypeSource, PrototypeTable, resolve_client_key};
