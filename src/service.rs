//! Service wiring and boundary operations.
//!
//! `BrowseService` owns the immutable index artifacts (feature store,
//! cluster seeds, keyword prototypes) and the mutable admission state
//! (rate limiters and keyed semaphores), and exposes the operations the
//! transport layer calls into: the first-page sample and the three
//! neighbor lookups. Everything model- or database-shaped stays behind
//! trait seams or out of the crate entirely.

use std::collections::HashSet;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{BrowseError, BrowseResult};
use crate::index::query::{NeighborMap, QueryOptions};
use crate::index::store::{FeatureStore, read_shard};
use crate::index::types::{IndexError, ProductId};
use crate::index::{cluster, query};
use crate::limits::rate::RateLimiter;
use crate::limits::semaphore::KeyedSemaphore;

/// Source of prototype feature vectors for keyword queries.
///
/// In production this is backed by rows of the classifier head's weight
/// matrix (an external collaborator); the built-in [`PrototypeTable`]
/// serves the same vectors from a shard-format file instead.
pub trait PrototypeSource: Send + Sync {
    /// Returns the raw prototype vector for `keyword`, if one exists.
    fn prototype(&self, keyword: &str) -> Option<Vec<f32>>;
}

/// Keyword prototype table loaded from a shard-format file.
pub struct PrototypeTable {
    store: FeatureStore,
}

impl PrototypeTable {
    /// Loads the table; IDs in the file are the keywords.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let entries = read_shard(path)?;
        let store = FeatureStore::from_parts(entries)?;
        info!(keywords = store.len(), "loaded keyword prototypes");
        Ok(Self { store })
    }
}

impl PrototypeSource for PrototypeTable {
    fn prototype(&self, keyword: &str) -> Option<Vec<f32>> {
        let row = self.store.index_of(&ProductId::new(keyword))?;
        Some(self.store.row(row).to_vec())
    }
}

/// The retrieval core behind the serving layer.
pub struct BrowseService {
    store: FeatureStore,
    seeds: Vec<ProductId>,
    prototypes: Option<Box<dyn PrototypeSource>>,
    neighbor_limiter: RateLimiter,
    neighbor_sem: KeyedSemaphore,
    encode_limiter: RateLimiter,
    image_sem: KeyedSemaphore,
    query: QuerySettingsInner,
}

/// Frozen copy of the query settings, shared by all three lookups.
struct QuerySettingsInner {
    strides: Vec<usize>,
    query_limit: usize,
    result_limit: usize,
    dedup_threshold: f32,
    dedup_batch_size: usize,
}

impl BrowseService {
    /// Builds the service: loads shards, applies the whitelist, computes
    /// or loads the cluster seeds, and wires the admission layer.
    ///
    /// Any failure here is fatal; the process must not start serving with
    /// a partial index.
    pub fn new(settings: &Settings) -> BrowseResult<Self> {
        let full_store = FeatureStore::load(&settings.feature_dir)?;

        // Seeds are always computed against the unfiltered store so the
        // cache stays valid when the whitelist changes between runs; the
        // whitelist is applied to the result afterwards.
        let mut seeds =
            cluster::build_or_load(&full_store, &settings.cluster_cache, &settings.cluster)?;

        let store = match &settings.whitelist_path {
            Some(path) => {
                let whitelist = load_whitelist(path)?;
                seeds.retain(|id| whitelist.contains(id));
                full_store.filter_by_whitelist(&whitelist)?
            }
            None => full_store,
        };

        let prototypes: Option<Box<dyn PrototypeSource>> = match &settings.prototype_path {
            Some(path) => Some(Box::new(PrototypeTable::load(path)?)),
            None => None,
        };

        let limits = &settings.limits;
        Ok(Self {
            store,
            seeds,
            prototypes,
            neighbor_limiter: RateLimiter::new(limits.max_neighbors_per_hour),
            neighbor_sem: KeyedSemaphore::new(
                limits.neighbor_concurrency,
                limits.neighbor_queue_limit,
            ),
            encode_limiter: RateLimiter::new(limits.max_encodes_per_hour),
            image_sem: KeyedSemaphore::new(limits.image_concurrency, limits.image_queue_limit),
            query: QuerySettingsInner {
                strides: settings.query.strides.clone(),
                query_limit: settings.query.query_limit,
                result_limit: settings.query.result_limit,
                dedup_threshold: settings.query.dedup_threshold,
                dedup_batch_size: settings.query.dedup_batch_size,
            },
        })
    }

    /// Starts the background leak tasks. Call once a runtime is available.
    pub fn start(&self) {
        self.neighbor_limiter.start();
        self.encode_limiter.start();
    }

    /// Stops the background leak tasks.
    pub fn shutdown(&self) {
        self.neighbor_limiter.shutdown();
        self.encode_limiter.shutdown();
    }

    /// The diversity-sampled seed IDs for an unscoped first page.
    #[must_use]
    pub fn first_page(&self) -> &[ProductId] {
        &self.seeds
    }

    /// The feature store backing queries (whitelist-filtered if one is
    /// configured).
    #[must_use]
    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    /// Neighbors of an item already in the index.
    ///
    /// The item itself and its near-duplicates are excluded from results.
    pub async fn neighbors_by_id(
        &self,
        client: &str,
        id: &ProductId,
    ) -> BrowseResult<NeighborMap> {
        self.admit_neighbors(client)?;
        let row = self
            .store
            .index_of(id)
            .ok_or_else(|| IndexError::IdNotFound(id.clone()))?;
        let vector = self.store.row(row).to_vec();
        self.gated_query(client, vector, true).await
    }

    /// Neighbors of a keyword's prototype vector.
    pub async fn neighbors_by_keyword(
        &self,
        client: &str,
        keyword: &str,
    ) -> BrowseResult<NeighborMap> {
        self.admit_neighbors(client)?;
        let mut vector = self
            .prototypes
            .as_ref()
            .and_then(|source| source.prototype(keyword))
            .ok_or_else(|| IndexError::KeywordNotFound(keyword.to_string()))?;
        normalize(&mut vector);
        self.gated_query(client, vector, false).await
    }

    /// Neighbors of a client-submitted feature vector, base64-encoded.
    pub async fn neighbors_by_feature(
        &self,
        client: &str,
        encoded: &str,
    ) -> BrowseResult<NeighborMap> {
        self.admit_neighbors(client)?;
        let mut vector = decode_feature(encoded, self.store.dimension().get())?;
        normalize(&mut vector);
        self.gated_query(client, vector, false).await
    }

    /// Rate limiter for the encode endpoint (model inference lives with
    /// the caller; admission lives here).
    #[must_use]
    pub fn encode_limiter(&self) -> &RateLimiter {
        &self.encode_limiter
    }

    /// Per-client concurrency gate for image I/O.
    #[must_use]
    pub fn image_semaphore(&self) -> &KeyedSemaphore {
        &self.image_sem
    }

    fn admit_neighbors(&self, client: &str) -> BrowseResult<()> {
        if !self.neighbor_limiter.try_use(client) {
            return Err(BrowseError::RateLimited {
                key: client.to_string(),
            });
        }
        Ok(())
    }

    async fn gated_query(
        &self,
        client: &str,
        vector: Vec<f32>,
        dedup_against_query: bool,
    ) -> BrowseResult<NeighborMap> {
        let options = QueryOptions {
            strides: self.query.strides.clone(),
            query_limit: self.query.query_limit,
            result_limit: self.query.result_limit,
            dedup_threshold: self.query.dedup_threshold,
            dedup_batch_size: self.query.dedup_batch_size,
            dedup_against_query,
        };
        let result = self
            .neighbor_sem
            .run(client, async { query::neighbors(&self.store, &vector, &options) })
            .await?;
        Ok(result?)
    }
}

/// Resolves the client key for admission control.
///
/// With no proxies the peer address is the key. Behind `proxy_count`
/// proxies the key is the address the outermost trusted proxy saw, i.e.
/// the `proxy_count`-th entry from the end of the forwarded-for chain.
/// A shorter-than-expected chain is logged and falls back to the first
/// entry, never trusting a client-supplied prefix.
#[must_use]
pub fn resolve_client_key(
    peer_address: &str,
    forwarded_for: Option<&str>,
    proxy_count: usize,
) -> String {
    if proxy_count == 0 {
        return peer_address.to_string();
    }
    let entries: Vec<&str> = forwarded_for
        .map(|header| header.split(',').map(str::trim).collect())
        .unwrap_or_default();
    if entries.len() < proxy_count {
        warn!(
            entries = entries.len(),
            proxy_count, "forwarded-for chain shorter than proxy count"
        );
        return entries.first().copied().unwrap_or_default().to_string();
    }
    entries[entries.len() - proxy_count].to_string()
}

/// Decodes a base64 feature vector of exactly `dimension` little-endian
/// f32 values.
pub fn decode_feature(encoded: &str, dimension: usize) -> BrowseResult<Vec<f32>> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| BrowseError::FeatureNotBase64 {
            reason: e.to_string(),
        })?;
    let expected_bytes = dimension * 4;
    if bytes.len() != expected_bytes {
        return Err(BrowseError::FeatureWrongLength {
            expected_bytes,
            actual_bytes: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Encodes a feature vector for the wire, inverse of [`decode_feature`].
#[must_use]
pub fn encode_feature(vector: &[f32]) -> String {
    let bytes: Vec<u8> = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
    BASE64.encode(bytes)
}

/// Reads a whitelist file: one ID per line, blank lines ignored.
fn load_whitelist(path: &Path) -> Result<HashSet<ProductId>, IndexError> {
    let text = std::fs::read_to_string(path).map_err(|source| IndexError::ShardRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ProductId::new)
        .collect())
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_client_key_direct() {
        assert_eq!(resolve_client_key("10.0.0.1", None, 0), "10.0.0.1");
        // Forwarded headers are ignored when no proxies are trusted.
        assert_eq!(
            resolve_client_key("10.0.0.1", Some("1.2.3.4"), 0),
            "10.0.0.1"
        );
    }

    #[test]
    fn test_resolve_client_key_behind_proxies() {
        let header = Some("203.0.113.7, 198.51.100.2, 10.0.0.5");
        assert_eq!(resolve_client_key("127.0.0.1", header, 1), "10.0.0.5");
        assert_eq!(resolve_client_key("127.0.0.1", header, 2), "198.51.100.2");
        assert_eq!(resolve_client_key("127.0.0.1", header, 3), "203.0.113.7");
    }

    #[test]
    fn test_resolve_client_key_short_chain() {
        assert_eq!(
            resolve_client_key("127.0.0.1", Some("1.2.3.4"), 3),
            "1.2.3.4"
        );
        assert_eq!(resolve_client_key("127.0.0.1", None, 2), "");
    }

    #[test]
    fn test_feature_roundtrip() {
        let vector = vec![0.25f32, -1.5, 3.125, 0.0];
        let encoded = encode_feature(&vector);
        let decoded = decode_feature(&encoded, 4).unwrap();
        assert_eq!(decoded, vector);
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let err = decode_feature("not base64!!!", 4).unwrap_err();
        assert!(matches!(err, BrowseError::FeatureNotBase64 { .. }));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let encoded = encode_feature(&[1.0, 2.0]);
        let err = decode_feature(&encoded, 4).unwrap_err();
        assert!(matches!(
            err,
            BrowseError::FeatureWrongLength {
                expected_bytes: 16,
                actual_bytes: 8,
            }
        ));
    }
}
