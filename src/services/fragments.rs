//! 文档片段：上传文档按策略切块，每块作为 `document_fragment` 实体参与向量化

use text_splitter::{ChunkConfig, TextSplitter};

use super::digest::normalize_text;
use super::ContentSource;
use crate::db::{
    delete_fragments_for_target, get_fragment_by_id, insert_fragment, list_fragments_for_target,
    DbPool, DocumentFragment, EntityClass, NewFragment, Strategy,
};
use crate::error::{ResultExt, StoreResult};
use crate::utils::{validate_id, validate_not_empty};

/// 按字符数切块，块之间保留 overlap 个字符的重叠
pub fn split_document(text: &str, chunk_size: usize, chunk_overlap: usize) -> StoreResult<Vec<String>> {
    let chunk_config = ChunkConfig::new(chunk_size)
        .with_overlap(chunk_overlap)
        .validation_err("切块参数不合法")?;
    let splitter = TextSplitter::new(chunk_config);
    let normalized = normalize_text(text);
    Ok(splitter.chunks(&normalized).map(str::to_string).collect())
}

#[derive(Clone)]
pub struct FragmentStore {
    pool: DbPool,
}

impl FragmentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// 用新内容整体替换文档的片段，返回 (被删除的旧片段 id, 新片段 id)。
    /// 旧片段的向量随外键级联删除。
    pub async fn replace_document(
        &self,
        target_type: &str,
        target_id: i64,
        text: &str,
        strategy: &Strategy,
    ) -> StoreResult<(Vec<i64>, Vec<i64>)> {
        let target_type = validate_not_empty(target_type, "target_type")?;
        validate_id(target_id, "target_id")?;
        let chunks = split_document(
            text,
            strategy.chunk_size.max(1) as usize,
            strategy.chunk_overlap.max(0) as usize,
        )?;

        let mut tx = self.pool.begin().await?;
        let removed = delete_fragments_for_target(&mut *tx, target_type, target_id).await?;
        let mut created = Vec::with_capacity(chunks.len());
        for (number, chunk) in chunks.iter().enumerate() {
            let id = insert_fragment(
                &mut *tx,
                &NewFragment {
                    fragment_number: number as i64,
                    target_id,
                    target_type,
                    fragment: chunk,
                },
            )
            .await?;
            created.push(id);
        }
        tx.commit().await?;

        tracing::debug!(
            target_type,
            target_id,
            removed = removed.len(),
            created = created.len(),
            "Document fragments replaced"
        );
        Ok((removed, created))
    }

    pub async fn fragments(&self, target_type: &str, target_id: i64) -> StoreResult<Vec<DocumentFragment>> {
        Ok(list_fragments_for_target(&self.pool, target_type, target_id).await?)
    }

    pub async fn fragment_ids(&self, target_type: &str, target_id: i64) -> StoreResult<Vec<i64>> {
        Ok(self
            .fragments(target_type, target_id)
            .await?
            .into_iter()
            .map(|fragment| fragment.id)
            .collect())
    }

    pub async fn delete_document(&self, target_type: &str, target_id: i64) -> StoreResult<Vec<i64>> {
        Ok(delete_fragments_for_target(&self.pool, target_type, target_id).await?)
    }
}

/// 片段文本来源；其他实体类别不归这里管
#[derive(Clone)]
pub struct FragmentContent {
    pool: DbPool,
}

impl FragmentContent {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl ContentSource for FragmentContent {
    async fn entity_text(&self, class: EntityClass, entity_id: i64) -> StoreResult<Option<String>> {
        if class != EntityClass::DocumentFragment {
            return Ok(None);
        }
        Ok(get_fragment_by_id(&self.pool, entity_id)
            .await?
            .map(|fragment| fragment.fragment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{seed_strategy, test_pool};

    #[test]
    fn split_respects_chunk_size() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = split_document(text, 16, 4).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 16));
        assert!(split_document(text, 4, 4).is_err());
    }

    #[tokio::test]
    async fn replace_document_swaps_fragments() {
        let (_dir, pool) = test_pool().await;
        let strategy = seed_strategy(&pool, "rag").await;
        let store = FragmentStore::new(pool.clone());
        let content = FragmentContent::new(pool.clone());

        let long_text = "lorem ipsum dolor sit amet ".repeat(40);
        let (removed, first) = store
            .replace_document("upload", 5, &long_text, &strategy)
            .await
            .unwrap();
        assert!(removed.is_empty());
        assert!(first.len() > 1);

        let text = content
            .entity_text(EntityClass::DocumentFragment, first[0])
            .await
            .unwrap()
            .unwrap();
        assert!(long_text.starts_with(&text));
        assert!(content
            .entity_text(EntityClass::Topic, first[0])
            .await
            .unwrap()
            .is_none());

        let (mut removed, second) = store
            .replace_document("upload", 5, "short", &strategy)
            .await
            .unwrap();
        removed.sort();
        assert_eq!(removed, first);
        assert_eq!(second.len(), 1);
        assert_eq!(store.fragment_ids("upload", 5).await.unwrap(), second);
    }
}
