//! KV 存储模块 - 基于 sled 的持久化层
//!
//! 本模块提供：
//! - 进程重启后仍然存在的 Outbox / 本地缓存 / 同步游标
//! - 按命名空间（通常为用户）隔离的 Tree
//! - 单个 Tree 内的原子批量写入

use std::path::{Path, PathBuf};

use sled::{Db, Tree};

use crate::error::{FintrackError, Result};
use crate::storage::{DurableStore, StoreBatch, StoreWrite};

/// sled 版持久化层
#[derive(Debug)]
pub struct SledStore {
    base_path: PathBuf,
    db: Db,
    tree: Tree,
}

impl SledStore {
    /// 打开（或创建）`base_path/kv` 下的数据库，并使用 `namespace` 对应的 Tree
    pub async fn open(base_path: &Path, namespace: &str) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| FintrackError::Storage(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::warn!("sled 文件锁被占用，{}ms 后重试 ({}/{})", delay_ms, attempt + 1, MAX_OPEN_RETRIES);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            FintrackError::Storage(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree_name = format!("ns_{}", namespace);
        let tree = db
            .open_tree(&tree_name)
            .map_err(|e| FintrackError::Storage(format!("打开 Tree 失败: {}", e)))?;

        tracing::info!("KV 存储已打开: {} ({})", kv_path.display(), tree_name);

        Ok(Self { base_path, db, tree })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 删除整个命名空间
    pub fn drop_namespace(&self, namespace: &str) -> Result<bool> {
        let dropped = self
            .db
            .drop_tree(format!("ns_{}", namespace))
            .map_err(|e| FintrackError::Storage(format!("删除 Tree 失败: {}", e)))?;
        Ok(dropped)
    }
}

impl DurableStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .tree
            .get(key)
            .map_err(|e| FintrackError::Storage(format!("获取键值对失败: {}", e)))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, value) =
                item.map_err(|e| FintrackError::Storage(format!("扫描前缀失败: {}", e)))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| FintrackError::Storage(format!("键不是合法 UTF-8: {}", e)))?;
            results.push((key, value.to_vec()));
        }
        Ok(results)
    }

    fn commit(&self, batch: StoreBatch) -> Result<()> {
        let mut sled_batch = sled::Batch::default();
        for write in batch.into_writes() {
            match write {
                StoreWrite::Put(key, value) => sled_batch.insert(key.as_bytes(), value),
                StoreWrite::Delete(key) => sled_batch.remove(key.as_bytes()),
            }
        }
        self.tree
            .apply_batch(sled_batch)
            .map_err(|e| FintrackError::Storage(format!("批量写入失败: {}", e)))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.tree
            .clear()
            .map_err(|e| FintrackError::Storage(format!("清空 Tree 失败: {}", e)))?;
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        self.tree
            .flush()
            .map_err(|e| FintrackError::Storage(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sled_store_batch_and_scan() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledStore::open(temp_dir.path(), "test_user").await.unwrap();

        let mut batch = StoreBatch::new();
        batch.put_json("outbox:00000000000000000001", &json!({"seq": 1})).unwrap();
        batch.put_json("outbox:00000000000000000002", &json!({"seq": 2})).unwrap();
        batch.put_json("cache:budget:budget-7", &json!({"amount": 1})).unwrap();
        store.commit(batch).unwrap();

        let outbox = store.scan_prefix("outbox:").unwrap();
        assert_eq!(outbox.len(), 2);
        assert!(outbox[0].0 < outbox[1].0);

        let mut batch = StoreBatch::new();
        batch.delete("outbox:00000000000000000001");
        store.commit(batch).unwrap();
        assert_eq!(store.scan_prefix("outbox:").unwrap().len(), 1);

        store.clear().unwrap();
        assert!(store.get("cache:budget:budget-7").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sled_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SledStore::open(temp_dir.path(), "test_user").await.unwrap();
            let mut batch = StoreBatch::new();
            batch.put_json("sync_cursor:transaction", &42u64).unwrap();
            store.commit(batch).unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(temp_dir.path(), "test_user").await.unwrap();
        let raw = store.get("sync_cursor:transaction").unwrap().unwrap();
        let cursor: u64 = serde_json::from_slice(&raw).unwrap();
        assert_eq!(cursor, 42);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledStore::open(temp_dir.path(), "alice").await.unwrap();
        let mut batch = StoreBatch::new();
        batch.put_json("cache:account:a1", &json!({"name": "checking"})).unwrap();
        store.commit(batch).unwrap();
        assert!(store.drop_namespace("bob").is_ok());
        drop(store);

        let other = SledStore::open(temp_dir.path(), "bob").await.unwrap();
        assert!(other.get("cache:account:a1").unwrap().is_none());
    }
}
