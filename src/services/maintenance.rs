//! 后台维护队列
//!
//! 分区重建、增量刷新、退役模型清理都在一个 tokio 任务里串行执行。
//! 同一个任务在队列里只保留一份；开始执行前移出在途集合，执行期间的新写入可以再次入队。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::ann::{IndexManager, PartitionKey, RefreshOutcome};
use super::registry::DefinitionRegistry;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MaintenanceJob {
    RebuildPartition(PartitionKey),
    RefreshPartition(PartitionKey),
    PurgeDefinition(i64),
}

#[derive(Debug)]
enum Message {
    Job(MaintenanceJob),
    /// 排在它前面的任务都处理完后回复
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct MaintenanceQueue {
    sender: mpsc::Sender<Message>,
    inflight: Arc<Mutex<HashSet<MaintenanceJob>>>,
    cancel: Arc<AtomicBool>,
}

impl MaintenanceQueue {
    /// 需要在 tokio 运行时内调用
    pub fn spawn(
        index: Arc<IndexManager>,
        registry: DefinitionRegistry,
        buffer: usize,
        purge_batch: i64,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let inflight = Arc::new(Mutex::new(HashSet::new()));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            index,
            registry,
            purge_batch,
            inflight: inflight.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            worker.run(receiver).await;
        });

        Self {
            sender,
            inflight,
            cancel,
        }
    }

    /// 入队；任务已在队列中时返回 `Ok(false)`
    pub async fn enqueue(&self, job: MaintenanceJob) -> StoreResult<bool> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(StoreError::Config("维护队列已停止".into()));
        }
        {
            let mut inflight = self.inflight.lock().await;
            if !inflight.insert(job) {
                tracing::debug!(?job, "Maintenance job already queued");
                return Ok(false);
            }
        }

        if self.sender.send(Message::Job(job)).await.is_err() {
            self.inflight.lock().await.remove(&job);
            return Err(StoreError::Config("维护队列已停止".into()));
        }
        tracing::debug!(?job, "Maintenance job enqueued");
        Ok(true)
    }

    /// 等待此前入队的任务全部执行完
    pub async fn flush(&self) -> StoreResult<()> {
        let (reply, done) = oneshot::channel();
        self.sender
            .send(Message::Flush(reply))
            .await
            .map_err(|_| StoreError::Config("维护队列已停止".into()))?;
        done.await
            .map_err(|_| StoreError::Config("维护队列已停止".into()))
    }

    pub async fn queued(&self) -> usize {
        self.inflight.lock().await.len()
    }

    /// 正在进行的重建在下一页边界停止，不发布；剩余任务丢弃
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        tracing::info!("Maintenance queue shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

struct Worker {
    index: Arc<IndexManager>,
    registry: DefinitionRegistry,
    purge_batch: i64,
    inflight: Arc<Mutex<HashSet<MaintenanceJob>>>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<Message>) {
        while let Some(message) = receiver.recv().await {
            match message {
                Message::Job(job) => {
                    self.inflight.lock().await.remove(&job);
                    if self.cancel.load(Ordering::Relaxed) {
                        tracing::debug!(?job, "Maintenance job dropped after shutdown");
                        continue;
                    }
                    if let Err(err) = self.process(job).await {
                        tracing::error!(?job, error = %err, "Maintenance job failed");
                    }
                }
                Message::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        tracing::debug!("Maintenance worker stopped");
    }

    async fn process(&self, job: MaintenanceJob) -> StoreResult<()> {
        match job {
            MaintenanceJob::RebuildPartition(key) => {
                self.index.build_partition(key, &self.cancel).await?;
            }
            MaintenanceJob::RefreshPartition(key) => {
                let outcome = self.index.refresh_partition(key, &self.cancel).await?;
                if outcome != RefreshOutcome::Unchanged {
                    tracing::debug!(partition = %key, ?outcome, "Partition refresh finished");
                }
            }
            MaintenanceJob::PurgeDefinition(model_id) => {
                let removed = self.registry.purge(model_id, self.purge_batch).await?;
                self.index.drop_model(model_id).await;
                tracing::info!(model_id, removed, "Definition purge finished");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnnConfig;
    use crate::db::{DistanceFunction, EntityClass};
    use crate::services::testing::{seed_definition, seed_strategy, test_pool};
    use crate::services::EmbeddingTable;

    #[tokio::test]
    async fn rebuild_job_publishes_partition_before_flush_returns() {
        let (_dir, pool) = test_pool().await;
        let definition = seed_definition(&pool, 4, DistanceFunction::Cosine).await;
        let strategy = seed_strategy(&pool, "default").await;
        EmbeddingTable::new(pool.clone(), EntityClass::Post)
            .upsert(&definition, &strategy, 1, "d", &[1.0, 0.0, 0.0, 0.0])
            .await
            .unwrap();

        let index = Arc::new(IndexManager::new(pool.clone(), AnnConfig::default()));
        let queue = MaintenanceQueue::spawn(index.clone(), DefinitionRegistry::new(pool.clone()), 8, 100);
        let key = PartitionKey::new(EntityClass::Post, definition.id, strategy.id);

        assert!(queue.enqueue(MaintenanceJob::RebuildPartition(key)).await.unwrap());
        queue.flush().await.unwrap();
        assert_eq!(index.partition_stats(&key).await.unwrap().rows, 1);
        assert_eq!(queue.queued().await, 0);
    }

    #[tokio::test]
    async fn duplicate_jobs_are_collapsed_while_queued() {
        let (_dir, pool) = test_pool().await;
        let definition = seed_definition(&pool, 4, DistanceFunction::Cosine).await;
        let strategy = seed_strategy(&pool, "default").await;
        let index = Arc::new(IndexManager::new(pool.clone(), AnnConfig::default()));
        let queue = MaintenanceQueue::spawn(index.clone(), DefinitionRegistry::new(pool.clone()), 8, 100);
        let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy.id);
        let job = MaintenanceJob::RefreshPartition(key);

        // 模拟任务仍在排队
        queue.inflight.lock().await.insert(job);
        assert!(!queue.enqueue(job).await.unwrap());

        queue.inflight.lock().await.remove(&job);
        assert!(queue.enqueue(job).await.unwrap());
        queue.flush().await.unwrap();
        assert_eq!(queue.queued().await, 0);
        // 未发布的分区刷新时直接全量构建
        assert!(index.is_published(&key).await);
    }

    #[tokio::test]
    async fn purge_job_removes_rows_definition_and_partitions() {
        let (_dir, pool) = test_pool().await;
        let definition = seed_definition(&pool, 4, DistanceFunction::Cosine).await;
        let strategy = seed_strategy(&pool, "default").await;
        let table = EmbeddingTable::new(pool.clone(), EntityClass::Topic);
        for id in 1..=5 {
            table
                .upsert(&definition, &strategy, id, "d", &[id as f32, 1.0, 0.0, 0.0])
                .await
                .unwrap();
        }

        let registry = DefinitionRegistry::new(pool.clone());
        let index = Arc::new(IndexManager::new(pool.clone(), AnnConfig::default()));
        let queue = MaintenanceQueue::spawn(index.clone(), registry.clone(), 8, 2);
        let key = PartitionKey::new(EntityClass::Topic, definition.id, strategy.id);
        queue.enqueue(MaintenanceJob::RebuildPartition(key)).await.unwrap();
        queue.flush().await.unwrap();
        assert!(index.is_published(&key).await);

        registry.retire(definition.id, true).await.unwrap();
        queue.enqueue(MaintenanceJob::PurgeDefinition(definition.id)).await.unwrap();
        queue.flush().await.unwrap();

        assert_eq!(table.count(definition.id, strategy.id).await.unwrap(), 0);
        assert!(!index.is_published(&key).await);
        assert!(matches!(
            registry.get(definition.id).await,
            Err(StoreError::DefinitionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_jobs() {
        let (_dir, pool) = test_pool().await;
        let index = Arc::new(IndexManager::new(pool.clone(), AnnConfig::default()));
        let queue = MaintenanceQueue::spawn(index, DefinitionRegistry::new(pool), 4, 100);
        queue.shutdown();
        assert!(queue.is_shut_down());
        assert!(queue.enqueue(MaintenanceJob::PurgeDefinition(1)).await.is_err());
        queue.flush().await.unwrap();
    }
}
