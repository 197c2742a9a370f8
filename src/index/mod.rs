//! Embedding index: feature store, dedup, cluster seeds, neighbor queries.
//!
//! Everything in this module is immutable after startup. The store is
//! built once from shard files, seeds are computed (or loaded from cache)
//! before the service accepts traffic, and queries are pure functions that
//! run concurrently without synchronization.

pub mod cluster;
pub mod dedup;
pub mod query;
pub mod store;
pub mod types;

pub use cluster::ClusterConfig;
pub use dedup::{deduplicate, squared_distance};
pub use query::{NeighborMap, QueryOptions, neighbors};
pub use store::{FeatureStore, read_shard, write_shard};
pub use types::{IndexError, IndexResult, ProductId, VectorDimension};
