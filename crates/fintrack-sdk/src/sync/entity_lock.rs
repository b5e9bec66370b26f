//! 实体级锁
//!
//! Dispatcher、Reconciler 与 Recorder 在读写某个实体的缓存条目或其 Outbox 操作前
//! 都先取得该实体的锁：不同实体完全并行，同一实体严格串行。
//! 锁只覆盖本地的前后处理，等待网络时不持有。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::EntityKey;

/// 持有期间独占该实体
pub type EntityGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: RwLock<HashMap<EntityKey, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_lock(&self, key: &EntityKey) -> Arc<Mutex<()>> {
        // 先尝试读锁
        {
            let locks = self.locks.read();
            if let Some(lock) = locks.get(key) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write();
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &EntityKey) -> EntityGuard {
        self.get_lock(key).lock_owned().await
    }

    /// 同时锁定多个实体；按键排序加锁，避免互相等待
    pub async fn lock_many<'a, I>(&self, keys: I) -> Vec<EntityGuard>
    where
        I: IntoIterator<Item = &'a EntityKey>,
    {
        let mut keys: Vec<&EntityKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// 清理没有人持有的锁
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::EntityType;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_entity_serialized() {
        let locks = Arc::new(EntityLocks::new());
        let key = EntityKey::new(EntityType::Budget, "budget-7");

        let guard = locks.lock(&key).await;
        let contender = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_entities_parallel() {
        let locks = EntityLocks::new();
        let _a = locks.lock(&EntityKey::new(EntityType::Budget, "a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&EntityKey::new(EntityType::Budget, "b")),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_lock_many_dedups_and_prunes() {
        let locks = EntityLocks::new();
        let a = EntityKey::new(EntityType::Account, "a");
        let b = EntityKey::new(EntityType::Budget, "b");

        let guards = locks.lock_many([&b, &a, &b]).await;
        assert_eq!(guards.len(), 2);
        assert_eq!(locks.prune(), 0);
        drop(guards);
        assert_eq!(locks.prune(), 2);
        assert!(locks.is_empty());
    }
}
