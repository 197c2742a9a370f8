//! Deterministic k-means seed sampling for the unscoped "first page".
//!
//! Lloyd's algorithm is run at several center counts with stride-based
//! initialization and a fixed iteration budget. Everything here is
//! deterministic on purpose: given the same feature matrix the seed list
//! is byte-identical across runs, which is what makes the disk cache and
//! cross-run row indices trustworthy.
//!
//! # Cache
//!
//! The computed seed list is persisted once as a JSON array of IDs and
//! loaded verbatim on later startups. The cache is never re-validated
//! against the current feature set; changing the shards without deleting
//! the cache yields stale seeds (operational caveat, not a code path).

use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::index::dedup::squared_distance;
use crate::index::store::FeatureStore;
use crate::index::types::{IndexError, IndexResult, ProductId};

/// Parameters of the seed sampling pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Center counts to cluster at, ascending. Smaller counts run first so
    /// their representatives take precedence in the merged seed list.
    pub center_counts: Vec<usize>,

    /// Fixed Lloyd iteration budget per center count. There is no
    /// convergence check; the budget is the whole algorithm.
    pub iterations: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            center_counts: vec![16, 32, 64],
            iterations: 50,
        }
    }
}

/// Loads the cached seed list, or computes and persists it.
pub fn build_or_load(
    store: &FeatureStore,
    cache_path: impl AsRef<Path>,
    config: &ClusterConfig,
) -> IndexResult<Vec<ProductId>> {
    let cache_path = cache_path.as_ref();

    if cache_path.exists() {
        let bytes = std::fs::read(cache_path).map_err(|e| IndexError::CacheLoad {
            path: cache_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let seeds: Vec<ProductId> =
            serde_json::from_slice(&bytes).map_err(|e| IndexError::CacheLoad {
                path: cache_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        info!(seeds = seeds.len(), cache = %cache_path.display(), "loaded cluster seeds from cache");
        return Ok(seeds);
    }

    let seeds = build(store, config)?;
    persist(&seeds, cache_path)?;
    Ok(seeds)
}

/// Computes the seed list without touching the cache.
pub fn build(store: &FeatureStore, config: &ClusterConfig) -> IndexResult<Vec<ProductId>> {
    info!(vectors = store.len(), "clustering features");

    let mut seen = std::collections::HashSet::new();
    let mut seed_rows = Vec::new();
    for &center_count in &config.center_counts {
        debug!(center_count, "clustering at center count");
        for row in representatives(store, center_count, config.iterations)? {
            // First occurrence wins across center counts.
            if seen.insert(row) {
                seed_rows.push(row);
            }
        }
    }

    let seeds: Vec<ProductId> = seed_rows.iter().map(|&row| store.id(row).clone()).collect();
    info!(seeds = seeds.len(), "computed cluster seeds");
    Ok(seeds)
}

/// Runs fixed-budget k-means and returns, per final center, the row index
/// of the center's single nearest original vector.
fn representatives(
    store: &FeatureStore,
    center_count: usize,
    iterations: usize,
) -> IndexResult<Vec<usize>> {
    let n = store.len();
    if center_count == 0 || center_count > n {
        return Err(IndexError::InvalidCenterCount {
            center_count,
            vector_count: n,
        });
    }
    let dim = store.dimension().get();

    // Deterministic init: every (n / center_count)-th row.
    let step = n / center_count;
    let mut centers: Vec<Vec<f32>> = (0..center_count)
        .map(|c| store.row(c * step).to_vec())
        .collect();

    for _ in 0..iterations {
        // Assignment: nearest center by squared distance.
        let assignments: Vec<usize> = (0..n)
            .into_par_iter()
            .map(|row| nearest_center(store.row(row), &centers))
            .collect();

        // Update: mean of assigned vectors. A center with no assignments
        // keeps its previous value, so no division by zero can occur.
        let mut sums = vec![vec![0.0f64; dim]; center_count];
        let mut counts = vec![0usize; center_count];
        for (row, &center) in assignments.iter().enumerate() {
            counts[center] += 1;
            for (acc, &value) in sums[center].iter_mut().zip(store.row(row)) {
                *acc += f64::from(value);
            }
        }
        for (center, (sum, &count)) in centers.iter_mut().zip(sums.iter().zip(&counts)) {
            if count == 0 {
                continue;
            }
            for (value, acc) in center.iter_mut().zip(sum) {
                *value = (*acc / count as f64) as f32;
            }
        }
    }

    // Representative per center: the nearest original row, lowest index on ties.
    let representatives = centers
        .par_iter()
        .map(|center| {
            let mut best_row = 0;
            let mut best_distance = f32::INFINITY;
            for row in 0..n {
                let distance = squared_distance(store.row(row), center);
                if distance < best_distance {
                    best_distance = distance;
                    best_row = row;
                }
            }
            best_row
        })
        .collect();

    Ok(representatives)
}

/// Index of the nearest center to `vector`, lowest index on ties.
fn nearest_center(vector: &[f32], centers: &[Vec<f32>]) -> usize {
    let mut best_center = 0;
    let mut best_distance = f32::INFINITY;
    for (center_idx, center) in centers.iter().enumerate() {
        let distance = squared_distance(vector, center);
        if distance < best_distance {
            best_distance = distance;
            best_center = center_idx;
        }
    }
    best_center
}

/// Atomically writes the seed list next to `cache_path` and renames it in.
fn persist(seeds: &[ProductId], cache_path: &Path) -> IndexResult<()> {
    let cache_err = |source: std::io::Error| IndexError::CacheWrite {
        path: cache_path.to_path_buf(),
        source,
    };

    let dir = cache_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(cache_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(cache_err)?;
    serde_json::to_writer(&mut tmp, seeds)
        .map_err(|e| cache_err(std::io::Error::other(e)))?;
    tmp.persist(cache_path)
        .map_err(|e| cache_err(e.error))?;

    info!(cache = %cache_path.display(), "persisted cluster seeds");
    Ok(())
}
