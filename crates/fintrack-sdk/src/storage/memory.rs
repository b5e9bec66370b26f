use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{FintrackError, Result};
use crate::storage::{DurableStore, StoreBatch, StoreWrite};

/// 内存版持久化层，用于测试与临时会话
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟磁盘写满 / 配额耗尽
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn commit(&self, batch: StoreBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FintrackError::Storage("内存存储已配置为写入失败".to_string()));
        }
        let mut data = self.data.write();
        for write in batch.into_writes() {
            match write {
                StoreWrite::Put(key, value) => {
                    data.insert(key, value);
                }
                StoreWrite::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FintrackError::Storage("内存存储已配置为写入失败".to_string()));
        }
        self.data.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_commit_and_scan() {
        let store = MemoryStore::new();
        let mut batch = StoreBatch::new();
        batch.put_json("outbox:1", &json!({"a": 1})).unwrap();
        batch.put_json("outbox:2", &json!({"a": 2})).unwrap();
        batch.put_json("cache:x", &json!({"b": 1})).unwrap();
        store.commit(batch).unwrap();

        let outbox = store.scan_prefix("outbox:").unwrap();
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].0, "outbox:1");

        let mut batch = StoreBatch::new();
        batch.delete("outbox:1");
        store.commit(batch).unwrap();
        assert!(store.get("outbox:1").unwrap().is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_failed_commit_leaves_data_untouched() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let mut batch = StoreBatch::new();
        batch.put_json("outbox:1", &json!(1)).unwrap();
        assert!(matches!(store.commit(batch), Err(FintrackError::Storage(_))));
        assert!(store.is_empty());
    }
}
