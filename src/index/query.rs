//! Stride-sampled diversified neighbor retrieval.
//!
//! Instead of a contiguous top-k, each requested stride `s` samples every
//! s-th entry of the full distance ranking. Larger strides deliberately
//! skip near-duplicates and surface a broader swath of the catalog; the
//! trade is strict relevance rank for diversity at coarser detail levels.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::index::dedup::deduplicate;
use crate::index::store::FeatureStore;
use crate::index::types::{IndexResult, ProductId};

/// Parameters of a single neighbor query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Coarseness levels to sample at, e.g. `[1, 64, 256, 1024, 4096]`.
    pub strides: Vec<usize>,

    /// Maximum samples taken from the ranking per stride, before dedup.
    pub query_limit: usize,

    /// Maximum IDs returned per stride, after dedup.
    pub result_limit: usize,

    /// Squared-distance threshold below which two results are duplicates.
    pub dedup_threshold: f32,

    /// Batch size for the dedup distance pass.
    pub dedup_batch_size: usize,

    /// When set, the best match is skipped (the query vector is itself a
    /// row of the index, always nearest to itself) and the query is
    /// prefixed into the dedup so near-copies of it are dropped.
    pub dedup_against_query: bool,
}

/// Ranked, diversified, deduplicated neighbor IDs per stride.
pub type NeighborMap = HashMap<usize, Vec<ProductId>>;

/// Runs a neighbor query for `vector` against the immutable store.
///
/// Pure function over read-only data; any number of queries may run in
/// parallel. The query vector is expected to be L2-normalized like every
/// stored row.
pub fn neighbors(
    store: &FeatureStore,
    vector: &[f32],
    options: &QueryOptions,
) -> IndexResult<NeighborMap> {
    store.dimension().validate_vector(vector)?;

    let order = ranked_rows(store, vector);
    // With dedup-against-query the best match is the query itself; skip it.
    let offset = usize::from(options.dedup_against_query);

    let mut results = HashMap::with_capacity(options.strides.len());
    for &stride in &options.strides {
        let window = sample_window(&order[offset..], stride, options.query_limit);
        let ids = dedup_window(store, vector, &window, options);
        results.insert(stride, ids);
    }
    Ok(results)
}

/// All row indices sorted ascending by squared distance to `vector`.
///
/// Uses ‖a−b‖² = ‖a‖² + ‖b‖² − 2a·b with the store's precomputed row
/// norms, so each row costs a single dot product. The sort is stable:
/// equal distances keep row order, keeping output deterministic.
fn ranked_rows(store: &FeatureStore, vector: &[f32]) -> Vec<usize> {
    let query_sq: f32 = vector.iter().map(|x| x * x).sum();
    let sq_norms = store.sq_norms();

    let distances: Vec<f32> = (0..store.len())
        .into_par_iter()
        .map(|row| {
            let dot: f32 = store
                .row(row)
                .iter()
                .zip(vector)
                .map(|(a, b)| a * b)
                .sum();
            sq_norms[row] + query_sq - 2.0 * dot
        })
        .collect();

    let mut order: Vec<usize> = (0..store.len()).collect();
    order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));
    order
}

/// Takes positions s−1, 2s−1, … of the ranked order, up to `limit` samples.
fn sample_window(order: &[usize], stride: usize, limit: usize) -> Vec<usize> {
    if stride == 0 {
        return Vec::new();
    }
    (0..limit)
        .map(|k| (k + 1) * stride - 1)
        .take_while(|&pos| pos < order.len())
        .map(|pos| order[pos])
        .collect()
}

/// Deduplicates a candidate window and maps survivors back to IDs.
///
/// When deduplicating against the query, the query vector occupies the
/// first (highest-priority) slot; after the pass the prefix slot is
/// dropped and the remaining indices shift down by one.
fn dedup_window(
    store: &FeatureStore,
    vector: &[f32],
    window: &[usize],
    options: &QueryOptions,
) -> Vec<ProductId> {
    let mut candidates: Vec<Vec<f32>> = Vec::with_capacity(window.len() + 1);
    if options.dedup_against_query {
        candidates.push(vector.to_vec());
    }
    candidates.extend(window.iter().map(|&row| store.row(row).to_vec()));

    let mut keep = deduplicate(&candidates, options.dedup_threshold, options.dedup_batch_size);
    if options.dedup_against_query {
        keep.retain(|&i| i > 0);
        for i in &mut keep {
            *i -= 1;
        }
    }

    keep.truncate(options.result_limit);
    keep.into_iter()
        .map(|i| store.id(window[i]).clone())
        .collect()
}
