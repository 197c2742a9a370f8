//! Configuration for the retrieval service.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `LOOKALIKE_` and use double
//! underscores to separate nested levels:
//! - `LOOKALIKE_LIMITS__MAX_NEIGHBORS_PER_HOUR=500` sets `limits.max_neighbors_per_hour`
//! - `LOOKALIKE_QUERY__DEDUP_THRESHOLD=0.02` sets `query.dedup_threshold`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::index::cluster::ClusterConfig;

/// Name of the configuration file searched in the working directory.
const CONFIG_FILE: &str = "lookalike.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Directory holding the numbered feature shard files
    #[serde(default = "default_feature_dir")]
    pub feature_dir: PathBuf,

    /// Path of the cluster seed cache artifact
    #[serde(default = "default_cluster_cache")]
    pub cluster_cache: PathBuf,

    /// Optional whitelist file (one ID per line); restricts the index and
    /// the seed list to the listed IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelist_path: Option<PathBuf>,

    /// Optional keyword prototype table, stored in shard format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prototype_path: Option<PathBuf>,

    /// Number of reverse proxies in front of the service; 0 means client
    /// keys come from the peer address directly
    #[serde(default = "default_proxy_count")]
    pub proxy_count: usize,

    /// Neighbor query parameters
    #[serde(default)]
    pub query: QuerySettings,

    /// Seed clustering parameters
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Admission control parameters
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QuerySettings {
    /// Coarseness levels sampled per query
    #[serde(default = "default_strides")]
    pub strides: Vec<usize>,

    /// Samples taken from the ranking per stride, before dedup
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,

    /// Results returned per stride, after dedup
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,

    /// Squared-distance threshold for near-duplicate results
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,

    /// Batch size of the dedup distance pass
    #[serde(default = "default_dedup_batch_size")]
    pub dedup_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    /// Hourly budget per client for the neighbors endpoint
    #[serde(default = "default_max_neighbors_per_hour")]
    pub max_neighbors_per_hour: f64,

    /// Hourly budget per client for the encode endpoint
    #[serde(default = "default_max_encodes_per_hour")]
    pub max_encodes_per_hour: f64,

    /// Concurrent neighbor queries per client
    #[serde(default = "default_neighbor_concurrency")]
    pub neighbor_concurrency: usize,

    /// Queued neighbor queries per client before shedding
    #[serde(default = "default_neighbor_queue_limit")]
    pub neighbor_queue_limit: usize,

    /// Concurrent image fetches per client
    #[serde(default = "default_image_concurrency")]
    pub image_concurrency: usize,

    /// Queued image fetches per client before shedding
    #[serde(default = "default_image_queue_limit")]
    pub image_queue_limit: usize,
}

// Default value functions
fn default_feature_dir() -> PathBuf {
    PathBuf::from("features")
}
fn default_cluster_cache() -> PathBuf {
    PathBuf::from("clusters.json")
}
fn default_proxy_count() -> usize {
    0
}
fn default_strides() -> Vec<usize> {
    vec![1, 64, 256, 1024, 4096]
}
fn default_query_limit() -> usize {
    128
}
fn default_result_limit() -> usize {
    128
}
fn default_dedup_threshold() -> f32 {
    0.01
}
fn default_dedup_batch_size() -> usize {
    128
}
fn default_max_neighbors_per_hour() -> f64 {
    1000.0
}
fn default_max_encodes_per_hour() -> f64 {
    1000.0
}
fn default_neighbor_concurrency() -> usize {
    1
}
fn default_neighbor_queue_limit() -> usize {
    64
}
fn default_image_concurrency() -> usize {
    64
}
fn default_image_queue_limit() -> usize {
    2048
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            feature_dir: default_feature_dir(),
            cluster_cache: default_cluster_cache(),
            whitelist_path: None,
            prototype_path: None,
            proxy_count: default_proxy_count(),
            query: QuerySettings::default(),
            cluster: ClusterConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            strides: default_strides(),
            query_limit: default_query_limit(),
            result_limit: default_result_limit(),
            dedup_threshold: default_dedup_threshold(),
            dedup_batch_size: default_dedup_batch_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_neighbors_per_hour: default_max_neighbors_per_hour(),
            max_encodes_per_hour: default_max_encodes_per_hour(),
            neighbor_concurrency: default_neighbor_concurrency(),
            neighbor_queue_limit: default_neighbor_queue_limit(),
            image_concurrency: default_image_concurrency(),
            image_queue_limit: default_image_queue_limit(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(CONFIG_FILE))
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path))
    }

    fn figment(
        file: figment::providers::Data<Toml>,
    ) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(file)
            // Layer in environment variables with LOOKALIKE_ prefix
            // Use double underscore (__) to separate nested levels
            .merge(Env::prefixed("LOOKALIKE_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }
}
