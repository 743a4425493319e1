use std::collections::HashSet;
use std::sync::atomic::AtomicBool;

use super::*;
use crate::config::AnnConfig;
use crate::db::{DistanceFunction, EntityClass};
use crate::services::testing::{
    brute_force, clustered_unit_vectors, random_unit_vectors, seed_definition, seed_strategy,
    test_pool,
};
use crate::services::EmbeddingTable;

fn small_pages() -> AnnConfig {
    AnnConfig {
        scan_batch_size: 7,
        ..AnnConfig::default()
    }
}

#[tokio::test]
async fn build_publishes_all_rows_across_pages() {
    let (_dir, pool) = test_pool().await;
    let definition = seed_definition(&pool, 8, DistanceFunction::Cosine).await;
    let strategy = seed_strategy(&pool, "default").await;
    let table = EmbeddingTable::new(pool.clone(), EntityClass::Post);
    let rows: Vec<_> = clustered_unit_vectors(1, 3, 10, 8, 0.5)
        .into_iter()
        .enumerate()
        .map(|(i, (vector, _))| (i as i64 + 1, format!("d{}", i), vector))
        .collect();
    table.upsert_batch(&definition, &strategy, &rows).await.unwrap();

    let manager = IndexManager::new(pool.clone(), small_pages());
    let key = PartitionKey::new(EntityClass::Post, definition.id, strategy.id);
    assert!(!manager.is_published(&key).await);

    assert!(manager.build_partition(key, &AtomicBool::new(false)).await.unwrap());
    let stats = manager.partition_stats(&key).await.unwrap();
    assert_eq!(stats.rows, 30);
    assert_eq!(stats.dimensions, 8);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn missing_partition_is_unavailable_and_empty_partition_yields_nothing() {
    let (_dir, pool) = test_pool().await;
    let definition = seed_definition(&pool, 4, DistanceFunction::Cosine).await;
    let strategy = seed_strategy(&pool, "default").await;
    let manager = IndexManager::new(pool.clone(), AnnConfig::default());
    let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy.id);

    let err = manager.candidates(key, &[1.0, 0.0, 0.0, 0.0], 5).await.unwrap_err();
    assert!(err.is_recoverable());

    manager.build_partition(key, &AtomicBool::new(false)).await.unwrap();
    let candidates = manager.candidates(key, &[1.0, 0.0, 0.0, 0.0], 5).await.unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn cancelled_rebuild_keeps_old_partition_and_dirty_marks() {
    let (_dir, pool) = test_pool().await;
    let definition = seed_definition(&pool, 4, DistanceFunction::Cosine).await;
    let strategy = seed_strategy(&pool, "default").await;
    let manager = IndexManager::new(pool.clone(), AnnConfig::default());
    let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy.id);

    manager.build_partition(key, &AtomicBool::new(false)).await.unwrap();
    let before = manager.partition_stats(&key).await.unwrap().generation;
    manager.mark_dirty(key, 42);

    let published = manager.build_partition(key, &AtomicBool::new(true)).await.unwrap();
    assert!(!published);
    assert_eq!(manager.partition_stats(&key).await.unwrap().generation, before);
    assert_eq!(manager.pending(&key), 1);
}

#[tokio::test]
async fn writes_to_unbuilt_partitions_are_not_tracked() {
    let (_dir, pool) = test_pool().await;
    let definition = seed_definition(&pool, 4, DistanceFunction::Cosine).await;
    let strategy = seed_strategy(&pool, "default").await;
    let manager = IndexManager::new(pool.clone(), AnnConfig::default());
    let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy.id);

    for id in 1..=1000 {
        manager.mark_dirty(key, id);
    }
    assert_eq!(manager.pending(&key), 0);
    assert!(!manager.needs_refresh(&key).await);

    // 首次构建被取消后也不留下跟踪状态
    assert!(!manager.build_partition(key, &AtomicBool::new(true)).await.unwrap());
    manager.mark_dirty(key, 7);
    assert_eq!(manager.pending(&key), 0);

    manager.build_partition(key, &AtomicBool::new(false)).await.unwrap();
    manager.mark_dirty(key, 7);
    assert_eq!(manager.pending(&key), 1);

    manager.drop_partition(&key).await;
    manager.mark_dirty(key, 8);
    assert_eq!(manager.pending(&key), 0);
}

#[tokio::test]
async fn dirty_rows_are_candidates_until_refreshed() {
    let (_dir, pool) = test_pool().await;
    let definition = seed_definition(&pool, 16, DistanceFunction::Cosine).await;
    let strategy = seed_strategy(&pool, "default").await;
    let table = EmbeddingTable::new(pool.clone(), EntityClass::Topic);
    let data = clustered_unit_vectors(2, 10, 10, 16, 0.3);
    let rows: Vec<_> = data
        .iter()
        .enumerate()
        .map(|(i, (vector, _))| (i as i64 + 1, "d".to_string(), vector.clone()))
        .collect();
    table.upsert_batch(&definition, &strategy, &rows).await.unwrap();

    let config = AnnConfig {
        overfetch_factor: 1,
        min_candidates: 1,
        drift_ratio: 0.5,
        scan_batch_size: 50,
    };
    let manager = IndexManager::new(pool.clone(), config);
    let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy.id);
    manager.build_partition(key, &AtomicBool::new(false)).await.unwrap();

    // 新写入一行：未刷新前也要出现在候选里
    let newcomer = data[0].0.iter().map(|v| -v).collect::<Vec<f32>>();
    table.upsert(&definition, &strategy, 1000, "d", &newcomer).await.unwrap();
    manager.mark_dirty(key, 1000);

    let candidates = manager.candidates(key, &data[0].0, 1).await.unwrap();
    assert!(candidates.iter().any(|(id, _)| *id == 1000));
    assert_eq!(candidates.len(), 2);

    let outcome = manager.refresh_partition(key, &AtomicBool::new(false)).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Incremental(1));
    assert_eq!(manager.pending(&key), 0);
    assert_eq!(manager.partition_stats(&key).await.unwrap().rows, 101);

    let outcome = manager.refresh_partition(key, &AtomicBool::new(false)).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Unchanged);
}

#[tokio::test]
async fn heavy_drift_escalates_to_rebuild() {
    let (_dir, pool) = test_pool().await;
    let definition = seed_definition(&pool, 4, DistanceFunction::L2).await;
    let strategy = seed_strategy(&pool, "default").await;
    let table = EmbeddingTable::new(pool.clone(), EntityClass::Topic);
    let manager = IndexManager::new(pool.clone(), AnnConfig::default());
    let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy.id);

    table.upsert(&definition, &strategy, 1, "d", &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
    manager.build_partition(key, &AtomicBool::new(false)).await.unwrap();
    let before = manager.partition_stats(&key).await.unwrap().generation;

    for id in 2..=5 {
        table.upsert(&definition, &strategy, id, "d", &[0.0, 1.0, 0.0, 0.0]).await.unwrap();
        manager.mark_dirty(key, id);
    }
    let outcome = manager.refresh_partition(key, &AtomicBool::new(false)).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Rebuilt);
    let stats = manager.partition_stats(&key).await.unwrap();
    assert_eq!(stats.rows, 5);
    assert_ne!(stats.generation, before);
}

#[tokio::test]
async fn drop_model_forgets_every_partition_of_the_model() {
    let (_dir, pool) = test_pool().await;
    let definition = seed_definition(&pool, 4, DistanceFunction::Cosine).await;
    let first = seed_strategy(&pool, "first").await;
    let second = seed_strategy(&pool, "second").await;
    let manager = IndexManager::new(pool.clone(), AnnConfig::default());

    for strategy in [&first, &second] {
        for class in EntityClass::ALL {
            let key = PartitionKey::new(class, definition.id, strategy.id);
            manager.build_partition(key, &AtomicBool::new(false)).await.unwrap();
        }
    }
    assert_eq!(manager.drop_model(definition.id).await, 6);
    let key = PartitionKey::new(EntityClass::Post, definition.id, first.id);
    assert!(manager.partition_stats(&key).await.is_none());
}

/// 1000 个均匀随机的 768 维单位向量，默认参数下粗筛候选的 top-10 召回率不低于 0.9
#[tokio::test]
async fn quantized_candidates_keep_recall_floor_on_random_vectors() {
    let (_dir, pool) = test_pool().await;
    let dims = 768;
    let definition = seed_definition(&pool, dims as i64, DistanceFunction::Cosine).await;
    let strategy = seed_strategy(&pool, "default").await;
    let table = EmbeddingTable::new(pool.clone(), EntityClass::Post);

    let rows: Vec<(i64, Vec<f32>)> = random_unit_vectors(7, 1000, dims)
        .into_iter()
        .enumerate()
        .map(|(i, vector)| (i as i64 + 1, vector))
        .collect();
    let inputs: Vec<_> = rows
        .iter()
        .map(|(id, vector)| (*id, "d".to_string(), vector.clone()))
        .collect();
    table.upsert_batch(&definition, &strategy, &inputs).await.unwrap();

    let manager = IndexManager::new(pool.clone(), AnnConfig::default());
    let key = PartitionKey::new(EntityClass::Post, definition.id, strategy.id);
    manager.build_partition(key, &AtomicBool::new(false)).await.unwrap();

    let k = 10;
    let mut hits = 0;
    let mut total = 0;
    for query in random_unit_vectors(8, 20, dims) {
        let candidates: HashSet<i64> = manager
            .candidates(key, &query, k)
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let exact = brute_force(DistanceFunction::Cosine, &rows, &query, k);
        hits += exact.iter().filter(|id| candidates.contains(id)).count();
        total += exact.len();
    }

    let recall = hits as f64 / total as f64;
    assert!(recall >= 0.9, "recall {} below floor", recall);
}
