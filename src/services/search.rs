//! 相似度查询：量化粗筛 + 全精度重排序
//!
//! 分区不可用时退化为分页线性扫描，结果与有索引时一致，只是更慢。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use super::ann::{IndexManager, PartitionKey};
use super::embedding_table::EmbeddingTable;
use crate::db::{DbPool, DistanceFunction, EmbeddingDefinition, EmbeddingRecord, EntityClass};
use crate::error::{StoreError, StoreResult};
use crate::utils::validate_finite;

/// 查询对象：已有向量的实体，或调用方给出的向量
#[derive(Debug, Clone, Copy)]
pub enum SimilarityQuery<'a> {
    Entity(i64),
    Vector(&'a [f32]),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub entity_id: i64,
    pub distance: f32,
}

#[derive(Clone)]
pub struct SimilarityService {
    pool: DbPool,
    index: Arc<IndexManager>,
}

impl SimilarityService {
    pub fn new(pool: DbPool, index: Arc<IndexManager>) -> Self {
        Self { pool, index }
    }

    /// 按距离升序返回最多 k 个近邻，同距时 entity_id 小的在前。
    /// 实体查询不会返回实体自身。
    pub async fn nearest(
        &self,
        class: EntityClass,
        definition: &EmbeddingDefinition,
        strategy_id: i64,
        query: SimilarityQuery<'_>,
        k: usize,
        exclude: &[i64],
    ) -> StoreResult<Vec<Neighbor>> {
        let table = EmbeddingTable::new(self.pool.clone(), class);
        let mut excluded: HashSet<i64> = exclude.iter().copied().collect();
        let query_vector = match query {
            SimilarityQuery::Entity(entity_id) => {
                let record = table
                    .get(entity_id, definition.id, strategy_id)
                    .await?
                    .ok_or(StoreError::EmbeddingNotFound {
                        entity_class: class,
                        entity_id,
                        model_id: definition.id,
                        strategy_id,
                    })?;
                excluded.insert(entity_id);
                record.vector()?
            }
            SimilarityQuery::Vector(vector) => vector.to_vec(),
        };
        if query_vector.len() != definition.dims() {
            return Err(StoreError::VectorDimensionMismatch {
                model_id: definition.id,
                expected: definition.dims(),
                actual: query_vector.len(),
            });
        }
        validate_finite(&query_vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        // 调用方可以用很大的 k 表示“全部”，这里收紧到分区行数
        let rows = table.count(definition.id, strategy_id).await?;
        let k = k.min(usize::try_from(rows).unwrap_or(0));
        if k == 0 {
            return Ok(Vec::new());
        }

        let key = PartitionKey::new(class, definition.id, strategy_id);
        let distance = definition.distance_function;
        let scored = match self
            .index
            .candidates(key, &query_vector, k.saturating_add(excluded.len()))
            .await
        {
            Ok(candidates) => {
                let ids: Vec<i64> = candidates
                    .into_iter()
                    .map(|(id, _)| id)
                    .filter(|id| !excluded.contains(id))
                    .collect();
                let records = table.get_many(definition.id, strategy_id, &ids).await?;
                score_records(distance, &query_vector, &records)
            }
            Err(StoreError::IndexUnavailable(reason)) => {
                tracing::warn!(partition = %key, %reason, "Stale index degradation, falling back to linear scan");
                self.linear_scan(&table, key, distance, &query_vector, k, &excluded).await?
            }
            Err(err) => return Err(err),
        };

        Ok(rank(scored, k, &excluded))
    }

    /// 全分区扫描，堆里只保留当前最好的 k 个
    async fn linear_scan(
        &self,
        table: &EmbeddingTable,
        key: PartitionKey,
        distance: DistanceFunction,
        query: &[f32],
        k: usize,
        excluded: &HashSet<i64>,
    ) -> StoreResult<Vec<Neighbor>> {
        let page = self.index.config().scan_batch_size;
        let mut heap: BinaryHeap<Ranked> = BinaryHeap::with_capacity(k.min(page as usize) + 1);
        let mut cursor = 0;
        loop {
            let records = table
                .bulk_scan(key.model_id, key.strategy_id, cursor, page)
                .await?;
            let Some(last) = records.last() else { break };
            cursor = last.entity_id;

            for neighbor in score_records(distance, query, &records) {
                if excluded.contains(&neighbor.entity_id) {
                    continue;
                }
                heap.push(Ranked(neighbor));
                if heap.len() > k {
                    heap.pop();
                }
            }
        }
        Ok(heap.into_iter().map(|ranked| ranked.0).collect())
    }
}

/// 解码失败或维度不符的行直接跳过
fn score_records(distance: DistanceFunction, query: &[f32], records: &[EmbeddingRecord]) -> Vec<Neighbor> {
    records
        .iter()
        .filter_map(|record| {
            let vector = record.vector().ok()?;
            if vector.len() != query.len() {
                return None;
            }
            Some(Neighbor {
                entity_id: record.entity_id,
                distance: distance.distance(query, &vector),
            })
        })
        .collect()
}

fn rank(mut scored: Vec<Neighbor>, k: usize, excluded: &HashSet<i64>) -> Vec<Neighbor> {
    scored.retain(|neighbor| !excluded.contains(&neighbor.entity_id));
    scored.sort_by(compare);
    scored.dedup_by_key(|neighbor| neighbor.entity_id);
    scored.truncate(k);
    scored
}

fn compare(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then(a.entity_id.cmp(&b.entity_id))
}

/// 堆顶是当前最差的一个
struct Ranked(Neighbor);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        compare(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::config::AnnConfig;
    use crate::services::testing::{
        brute_force, random_unit_vectors, seed_definition, seed_strategy, test_pool,
    };
    use crate::services::EmbeddingTable;

    async fn seeded_service(
        distance: DistanceFunction,
        count: usize,
        dims: usize,
    ) -> (
        tempfile::TempDir,
        SimilarityService,
        EmbeddingDefinition,
        i64,
        Vec<(i64, Vec<f32>)>,
    ) {
        let (dir, pool) = test_pool().await;
        let definition = seed_definition(&pool, dims as i64, distance).await;
        let strategy = seed_strategy(&pool, "default").await;
        let rows: Vec<(i64, Vec<f32>)> = random_unit_vectors(11, count, dims)
            .into_iter()
            .enumerate()
            .map(|(i, vector)| (i as i64 + 1, vector))
            .collect();
        let inputs: Vec<_> = rows
            .iter()
            .map(|(id, vector)| (*id, "d".to_string(), vector.clone()))
            .collect();
        EmbeddingTable::new(pool.clone(), EntityClass::Topic)
            .upsert_batch(&definition, &strategy, &inputs)
            .await
            .unwrap();

        let config = AnnConfig {
            scan_batch_size: 13,
            min_candidates: 100,
            ..AnnConfig::default()
        };
        let index = Arc::new(IndexManager::new(pool.clone(), config));
        (dir, SimilarityService::new(pool, index), definition, strategy.id, rows)
    }

    fn ids(neighbors: &[Neighbor]) -> Vec<i64> {
        neighbors.iter().map(|n| n.entity_id).collect()
    }

    #[tokio::test]
    async fn fallback_scan_matches_brute_force_and_indexed_results() {
        let (_dir, service, definition, strategy_id, rows) =
            seeded_service(DistanceFunction::Cosine, 60, 16).await;
        let query = rows[4].1.clone();

        let fallback = service
            .nearest(EntityClass::Topic, &definition, strategy_id, SimilarityQuery::Vector(&query), 5, &[])
            .await
            .unwrap();
        assert_eq!(ids(&fallback), brute_force(DistanceFunction::Cosine, &rows, &query, 5));
        assert!(fallback.windows(2).all(|w| w[0].distance <= w[1].distance));

        // 候选下限覆盖全表，建好索引后结果必须一致
        let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy_id);
        service.index.build_partition(key, &AtomicBool::new(false)).await.unwrap();
        let indexed = service
            .nearest(EntityClass::Topic, &definition, strategy_id, SimilarityQuery::Vector(&query), 5, &[])
            .await
            .unwrap();
        assert_eq!(indexed, fallback);
    }

    #[tokio::test]
    async fn entity_query_excludes_itself_and_requested_ids() {
        let (_dir, service, definition, strategy_id, _rows) =
            seeded_service(DistanceFunction::Dot, 30, 8).await;

        let all = service
            .nearest(EntityClass::Topic, &definition, strategy_id, SimilarityQuery::Entity(1), 29, &[])
            .await
            .unwrap();
        assert_eq!(all.len(), 29);
        assert!(!ids(&all).contains(&1));

        let skip = all[0].entity_id;
        let rest = service
            .nearest(EntityClass::Topic, &definition, strategy_id, SimilarityQuery::Entity(1), 3, &[skip])
            .await
            .unwrap();
        assert_eq!(ids(&rest), ids(&all[1..4]));
    }

    #[tokio::test]
    async fn invalid_queries_are_rejected() {
        let (_dir, service, definition, strategy_id, _rows) =
            seeded_service(DistanceFunction::L2, 5, 4).await;

        let err = service
            .nearest(EntityClass::Topic, &definition, strategy_id, SimilarityQuery::Entity(99), 3, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EmbeddingNotFound { entity_id: 99, .. }));

        let err = service
            .nearest(
                EntityClass::Topic,
                &definition,
                strategy_id,
                SimilarityQuery::Vector(&[1.0, 0.0]),
                3,
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VectorDimensionMismatch { expected: 4, actual: 2, .. }));

        let err = service
            .nearest(
                EntityClass::Topic,
                &definition,
                strategy_id,
                SimilarityQuery::Vector(&[f32::NAN, 0.0, 0.0, 0.0]),
                3,
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let none = service
            .nearest(
                EntityClass::Topic,
                &definition,
                strategy_id,
                SimilarityQuery::Vector(&[1.0, 0.0, 0.0, 0.0]),
                0,
                &[],
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn oversized_k_returns_every_row() {
        let (_dir, service, definition, strategy_id, rows) =
            seeded_service(DistanceFunction::Cosine, 20, 8).await;
        let query = rows[0].1.clone();

        let scanned = service
            .nearest(
                EntityClass::Topic,
                &definition,
                strategy_id,
                SimilarityQuery::Vector(&query),
                usize::MAX,
                &[],
            )
            .await
            .unwrap();
        assert_eq!(ids(&scanned), brute_force(DistanceFunction::Cosine, &rows, &query, 20));

        let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy_id);
        service.index.build_partition(key, &AtomicBool::new(false)).await.unwrap();
        let indexed = service
            .nearest(
                EntityClass::Topic,
                &definition,
                strategy_id,
                SimilarityQuery::Entity(1),
                usize::MAX,
                &[2],
            )
            .await
            .unwrap();
        assert_eq!(indexed.len(), 18);

        let huge = service
            .nearest(
                EntityClass::Topic,
                &definition,
                strategy_id,
                SimilarityQuery::Vector(&query),
                1 << 40,
                &[],
            )
            .await
            .unwrap();
        assert_eq!(huge, scanned);
    }

    #[test]
    fn rank_orders_ties_by_entity_id_and_dedupes() {
        let scored = vec![
            Neighbor { entity_id: 9, distance: 0.5 },
            Neighbor { entity_id: 3, distance: 0.5 },
            Neighbor { entity_id: 3, distance: 0.5 },
            Neighbor { entity_id: 4, distance: 0.1 },
            Neighbor { entity_id: 7, distance: 0.0 },
        ];
        let excluded: HashSet<i64> = [7].into_iter().collect();
        assert_eq!(ids(&rank(scored, 10, &excluded)), vec![4, 3, 9]);
    }
}
