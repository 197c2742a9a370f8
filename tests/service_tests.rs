//! End-to-end tests for the retrieval service: shard loading, seed
//! caching, the three neighbor lookups, and admission control wired
//! together the way the serving layer uses them.

use std::f32::consts::FRAC_PI_8;

use lookalike::config::{LimitsConfig, QuerySettings, Settings};
use lookalike::index::cluster::ClusterConfig;
use lookalike::index::store::write_shard;
use lookalike::service::{BrowseService, encode_feature};
use lookalike::{BrowseError, ProductId, Rejection};
use tempfile::TempDir;

/// Points around the unit circle so every vector is already normalized
/// and pairwise distances are easy to reason about.
fn ring_entries(count: usize) -> Vec<(ProductId, Vec<f32>)> {
    (0..count)
        .map(|i| {
            let angle = i as f32 * FRAC_PI_8;
            (
                ProductId::new(format!("p{i}")),
                vec![angle.cos(), angle.sin()],
            )
        })
        .collect()
}

/// A settings tree rooted in `dir`, sized for tiny test fixtures.
fn test_settings(dir: &TempDir) -> Settings {
    Settings {
        feature_dir: dir.path().join("features"),
        cluster_cache: dir.path().join("clusters.json"),
        whitelist_path: None,
        prototype_path: None,
        proxy_count: 0,
        query: QuerySettings {
            strides: vec![1, 2],
            query_limit: 16,
            result_limit: 16,
            dedup_threshold: 1e-6,
            dedup_batch_size: 8,
        },
        cluster: ClusterConfig {
            center_counts: vec![2, 4],
            iterations: 10,
        },
        limits: LimitsConfig::default(),
    }
}

fn write_fixture(dir: &TempDir, entries: &[(ProductId, Vec<f32>)]) {
    let feature_dir = dir.path().join("features");
    std::fs::create_dir_all(&feature_dir).unwrap();
    // Two shards to exercise the multi-shard load path.
    let mid = entries.len() / 2;
    write_shard(feature_dir.join("0.shard"), &entries[..mid]).unwrap();
    write_shard(feature_dir.join("1.shard"), &entries[mid..]).unwrap();
}

#[tokio::test]
async fn test_neighbors_by_id_excludes_self() {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir, &ring_entries(10));
    let service = BrowseService::new(&test_settings(&dir)).unwrap();

    let target = ProductId::new("p4");
    let result = service.neighbors_by_id("client-a", &target).await.unwrap();

    let stride_one = &result[&1];
    assert!(!stride_one.is_empty());
    assert!(!stride_one.contains(&target));
    // Angular neighbors of p4 on the ring come back first.
    assert!(stride_one[0] == ProductId::new("p3") || stride_one[0] == ProductId::new("p5"));
}

#[tokio::test]
async fn test_neighbors_by_feature_matches_stored_item() {
    let dir = TempDir::new().unwrap();
    let entries = ring_entries(10);
    write_fixture(&dir, &entries);
    let service = BrowseService::new(&test_settings(&dir)).unwrap();

    // Query with p7's exact vector; without self-exclusion the item
    // itself must be the top result.
    let encoded = encode_feature(&entries[7].1);
    let result = service
        .neighbors_by_feature("client-a", &encoded)
        .await
        .unwrap();
    assert_eq!(result[&1][0], ProductId::new("p7"));
}

#[tokio::test]
async fn test_feature_query_rejects_wrong_dimension() {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir, &ring_entries(10));
    let service = BrowseService::new(&test_settings(&dir)).unwrap();

    let encoded = encode_feature(&[1.0, 0.0, 0.0]);
    let err = service
        .neighbors_by_feature("client-a", &encoded)
        .await
        .unwrap_err();
    assert!(matches!(err, BrowseError::FeatureWrongLength { .. }));
    assert_eq!(err.rejection(), Rejection::BadRequest);
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir, &ring_entries(10));
    let service = BrowseService::new(&test_settings(&dir)).unwrap();

    let err = service
        .neighbors_by_id("client-a", &ProductId::new("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Rejection::NotFound);
    assert_eq!(err.status_code(), "ID_NOT_FOUND");
}

#[tokio::test]
async fn test_missing_prototype_table_is_not_found() {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir, &ring_entries(10));
    let service = BrowseService::new(&test_settings(&dir)).unwrap();

    let err = service
        .neighbors_by_keyword("client-a", "sneakers")
        .await
        .unwrap_err();
    assert_eq!(err.rejection(), Rejection::NotFound);
}

#[tokio::test]
async fn test_keyword_query_uses_prototype_vector() {
    let dir = TempDir::new().unwrap();
    let entries = ring_entries(10);
    write_fixture(&dir, &entries);

    // Prototype pointing at p2's direction, deliberately un-normalized
    // to check the service normalizes it before querying.
    let prototype_path = dir.path().join("prototypes.shard");
    let prototypes = vec![(
        ProductId::new("sneakers"),
        entries[2].1.iter().map(|v| v * 7.5).collect::<Vec<f32>>(),
    )];
    write_shard(&prototype_path, &prototypes).unwrap();

    let mut settings = test_settings(&dir);
    settings.prototype_path = Some(prototype_path);
    let service = BrowseService::new(&settings).unwrap();

    let result = service
        .neighbors_by_keyword("client-a", "sneakers")
        .await
        .unwrap();
    assert_eq!(result[&1][0], ProductId::new("p2"));
}

#[tokio::test]
async fn test_rate_limit_applies_per_client() {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir, &ring_entries(10));

    let mut settings = test_settings(&dir);
    settings.limits.max_neighbors_per_hour = 2.0;
    let service = BrowseService::new(&settings).unwrap();

    let id = ProductId::new("p1");
    service.neighbors_by_id("busy", &id).await.unwrap();
    service.neighbors_by_id("busy", &id).await.unwrap();

    let err = service.neighbors_by_id("busy", &id).await.unwrap_err();
    assert_eq!(err.rejection(), Rejection::Backpressure);
    assert_eq!(err.status_code(), "RATE_LIMITED");

    // A different client still has its own budget.
    service.neighbors_by_id("idle", &id).await.unwrap();
}

#[test]
fn test_seed_cache_is_stable_across_restarts() {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir, &ring_entries(12));
    let settings = test_settings(&dir);

    let first = BrowseService::new(&settings).unwrap();
    let seeds_first = first.first_page().to_vec();
    assert!(!seeds_first.is_empty());
    assert!(settings.cluster_cache.exists());

    // Second construction must load the cache and reproduce the page.
    let second = BrowseService::new(&settings).unwrap();
    assert_eq!(second.first_page(), seeds_first.as_slice());
}

#[test]
fn test_whitelist_filters_store_and_seeds() {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir, &ring_entries(12));

    let whitelist_path = dir.path().join("whitelist.txt");
    std::fs::write(&whitelist_path, "p0\np1\np2\n\np3\n").unwrap();

    let mut settings = test_settings(&dir);
    settings.whitelist_path = Some(whitelist_path);
    let service = BrowseService::new(&settings).unwrap();

    assert_eq!(service.store().len(), 4);
    let allowed: Vec<ProductId> = (0..4).map(|i| ProductId::new(format!("p{i}"))).collect();
    for seed in service.first_page() {
        assert!(allowed.contains(seed));
    }
}

#[tokio::test]
async fn test_queries_serialize_per_client_but_still_complete() {
    let dir = TempDir::new().unwrap();
    write_fixture(&dir, &ring_entries(10));

    let mut settings = test_settings(&dir);
    settings.limits.neighbor_concurrency = 1;
    settings.limits.neighbor_queue_limit = 8;
    let service = std::sync::Arc::new(BrowseService::new(&settings).unwrap());

    let mut handles = Vec::new();
    for i in 0..4 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let id = ProductId::new(format!("p{i}"));
            service.neighbors_by_id("shared", &id).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}
