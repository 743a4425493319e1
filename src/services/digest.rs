//! 内容摘要
//!
//! 摘要 = SHA-256(规范化文本 + 策略参数)，是判断向量是否过期的唯一依据。
//! 每个字段都带长度前缀写入哈希，字段之间不会互相“挪位”。

use sha2::{Digest, Sha256};

use super::ContentSource;
use crate::db::{EntityClass, Strategy};
use crate::error::{StoreError, StoreResult};

const DIGEST_DOMAIN: &[u8] = b"vectorvault.digest.v1";

/// 统一换行、去掉行首尾空白、合并连续空行
pub fn normalize_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = false;

    for line in unified.lines().map(str::trim) {
        if line.is_empty() {
            blank_run = true;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run { "\n\n" } else { "\n" });
        }
        out.push_str(line);
        blank_run = false;
    }
    out
}

/// 规范化后按策略截断（按字符，不切断 UTF-8）
pub fn prepare_text(raw: &str, strategy: &Strategy) -> String {
    let normalized = normalize_text(raw);
    let max_chars = strategy.max_chars.max(1) as usize;
    match normalized.char_indices().nth(max_chars) {
        Some((cut, _)) => normalized[..cut].trim_end().to_string(),
        None => normalized,
    }
}

/// 对已准备好的文本计算摘要
pub fn compute_digest(text: &str, strategy: &Strategy) -> StoreResult<String> {
    if text.trim().is_empty() {
        return Err(StoreError::DigestComputation("内容为空".into()));
    }

    let mut hasher = Sha256::new();
    write_field(&mut hasher, DIGEST_DOMAIN);
    write_field(&mut hasher, &strategy.id.to_le_bytes());
    write_field(&mut hasher, &strategy.version.to_le_bytes());
    write_field(&mut hasher, &strategy.max_chars.to_le_bytes());
    write_field(&mut hasher, &strategy.chunk_size.to_le_bytes());
    write_field(&mut hasher, &strategy.chunk_overlap.to_le_bytes());
    write_field(&mut hasher, text.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// 实体形式：通过宿主读取文本，返回 (准备好的文本, 摘要)
pub async fn digest_entity<C: ContentSource>(
    source: &C,
    class: EntityClass,
    entity_id: i64,
    strategy: &Strategy,
) -> StoreResult<(String, String)> {
    let raw = source.entity_text(class, entity_id).await?.ok_or_else(|| {
        StoreError::DigestComputation(format!("{}#{} 内容不可用", class, entity_id))
    })?;
    let text = prepare_text(&raw, strategy);
    let digest = compute_digest(&text, strategy)?;
    Ok((text, digest))
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> Strategy {
        Strategy {
            id: 1,
            name: "topic-default".into(),
            version: 1,
            max_chars: 100,
            chunk_size: 50,
            chunk_overlap: 10,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_text("  a  \r\n b\r\n\r\n\r\n\n c \n\n"), "a\nb\n\nc");
        assert_eq!(normalize_text("\n\n"), "");
    }

    #[test]
    fn digest_is_stable() {
        let s = strategy();
        let first = compute_digest("hello world", &s).unwrap();
        let second = compute_digest("hello world", &s).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn digest_sensitive_to_text_and_params() {
        let s = strategy();
        let base = compute_digest("hello world", &s).unwrap();
        assert_ne!(base, compute_digest("hello world!", &s).unwrap());
        assert_ne!(base, compute_digest("hello worle", &s).unwrap());

        let variants = [
            Strategy { version: 2, ..strategy() },
            Strategy { max_chars: 101, ..strategy() },
            Strategy { chunk_size: 51, ..strategy() },
            Strategy { chunk_overlap: 11, ..strategy() },
            Strategy { id: 2, ..strategy() },
        ];
        for variant in &variants {
            assert_ne!(base, compute_digest("hello world", variant).unwrap());
        }
    }

    #[test]
    fn whitespace_only_changes_do_not_change_digest() {
        let s = strategy();
        let a = compute_digest(&prepare_text("hello world\r\n", &s), &s).unwrap();
        let b = compute_digest(&prepare_text("  hello world  ", &s), &s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_content_is_rejected() {
        let s = strategy();
        assert!(matches!(
            compute_digest(&prepare_text(" \n\t ", &s), &s),
            Err(StoreError::DigestComputation(_))
        ));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = Strategy { max_chars: 3, ..strategy() };
        assert_eq!(prepare_text("向量存储系统", &s), "向量存");
        assert_eq!(prepare_text("ab", &s), "ab");
    }
}
