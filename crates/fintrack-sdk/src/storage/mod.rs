//! 本地存储模块
//!
//! - `DurableStore`：可替换的持久化能力接口（sled / 内存）
//! - `StorageManager`：Outbox + 本地缓存 + 同步游标的统一入口
//!
//! `StorageManager` 的每次变更都先以一个原子批次写入持久化层，提交成功后才更新内存镜像，
//! 因此内存与磁盘不会出现只写了一半的状态。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{FintrackError, Result};
use crate::sync::{EntityKey, EntityType, SyncCursors};
use crate::utils::time::now_millis;
use crate::version::STORE_LAYOUT_VERSION;

pub mod entities;
pub mod kv;
pub mod memory;
pub mod queue;

pub use entities::LocalCacheEntry;
pub use kv::SledStore;
pub use memory::MemoryStore;
pub use queue::{Outbox, OutboxStats, OperationKind, OperationStatus, PendingOperation};

/// 单条写入
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Put(String, Vec<u8>),
    Delete(String),
}

/// 一次逻辑操作对应的原子写入批次
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    writes: Vec<StoreWrite>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| FintrackError::Serialization(format!("序列化值失败: {}", e)))?;
        self.writes.push(StoreWrite::Put(key.into(), bytes));
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.push(StoreWrite::Delete(key.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn into_writes(self) -> Vec<StoreWrite> {
        self.writes
    }
}

/// 持久化能力接口
///
/// `commit` 必须是原子的：批次要么全部生效，要么全部不生效。
pub trait DurableStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// 按键的字典序返回
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    fn commit(&self, batch: StoreBatch) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// 常用的键前缀
pub mod keys {
    use crate::sync::{EntityKey, SyncCursors};

    /// Outbox 前缀，键内序号定长补零保证字典序即 FIFO
    pub const OUTBOX: &str = "outbox:";
    /// 本地缓存前缀
    pub const CACHE: &str = "cache:";
    /// 键布局版本
    pub const LAYOUT_VERSION: &str = "meta:layout_version";

    pub fn outbox(seq: u64) -> String {
        format!("{}{:020}", OUTBOX, seq)
    }

    pub fn cache(key: &EntityKey) -> String {
        format!("{}{}:{}", CACHE, key.entity_type.as_str(), key.entity_id)
    }

    pub fn sync_cursor(entity_type: crate::sync::EntityType) -> String {
        SyncCursors::key(entity_type)
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| FintrackError::Serialization(format!("反序列化 {} 失败: {}", key, e)))
}

/// 服务端权威状态
#[derive(Debug, Clone, PartialEq)]
pub struct ServerState {
    pub revision: u64,
    pub data: Option<Value>,
    pub timestamp: Option<i64>,
    pub origin_op_id: Option<String>,
}

/// 应用服务端状态的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStateOutcome {
    /// 覆盖了服务端基线，实体无待确认操作
    Overwritten,
    /// 更新了基线，待确认操作仍叠加在视图之上
    Staged,
    /// revision 不新于本地，丢弃
    Stale,
}

#[derive(Debug, Default)]
struct LocalState {
    outbox: Outbox,
    cache: HashMap<EntityKey, LocalCacheEntry>,
    cursors: SyncCursors,
}

impl LocalState {
    /// 基于当前 Outbox 重新计算实体视图，并把结果（或删除）写入批次
    fn rebuild_entry(
        &self,
        mut entry: LocalCacheEntry,
        batch: &mut StoreBatch,
    ) -> Result<Option<LocalCacheEntry>> {
        let key = entry.key();
        entry.recompute(&self.outbox.for_entity(&key));
        if entry.is_settled() && entry.server_revision.is_none() {
            batch.delete(keys::cache(&key));
            return Ok(None);
        }
        batch.put_json(keys::cache(&key), &entry)?;
        Ok(Some(entry))
    }

    fn install_entry(&mut self, key: EntityKey, entry: Option<LocalCacheEntry>) {
        match entry {
            Some(entry) => {
                self.cache.insert(key, entry);
            }
            None => {
                self.cache.remove(&key);
            }
        }
    }

    fn entry_or_new(&self, key: &EntityKey) -> LocalCacheEntry {
        self.cache
            .get(key)
            .cloned()
            .unwrap_or_else(|| LocalCacheEntry::new(key))
    }
}

/// Outbox + 本地缓存 + 同步游标
#[derive(Debug)]
pub struct StorageManager {
    durable: Arc<dyn DurableStore>,
    state: Mutex<LocalState>,
}

impl StorageManager {
    /// 从持久化层加载状态
    ///
    /// 结果不明的 `Dispatching` / `Conflicted` 操作回到 `Pending`，依赖 op_id 幂等重投。
    pub fn open(durable: Arc<dyn DurableStore>) -> Result<Self> {
        if let Some(raw) = durable.get(keys::LAYOUT_VERSION)? {
            let version: u32 = decode(keys::LAYOUT_VERSION, &raw)?;
            if version > STORE_LAYOUT_VERSION {
                return Err(FintrackError::Storage(format!(
                    "本地存储布局版本 {} 高于当前支持的 {}，拒绝打开",
                    version, STORE_LAYOUT_VERSION
                )));
            }
        }

        let mut batch = StoreBatch::new();
        batch.put_json(keys::LAYOUT_VERSION, &STORE_LAYOUT_VERSION)?;

        let mut recovered = 0usize;
        let mut ops = Vec::new();
        for (key, raw) in durable.scan_prefix(keys::OUTBOX)? {
            let mut op: PendingOperation = decode(&key, &raw)?;
            if op.recover_after_restart() {
                recovered += 1;
                batch.put_json(key.as_str(), &op)?;
            }
            ops.push(op);
        }

        let mut state = LocalState {
            outbox: Outbox::from_operations(ops),
            ..LocalState::default()
        };

        for (key, raw) in durable.scan_prefix(keys::CACHE)? {
            let entry: LocalCacheEntry = decode(&key, &raw)?;
            state.cache.insert(entry.key(), entry);
        }

        for (key, raw) in durable.scan_prefix(&SyncCursors::key_prefix())? {
            let entity_type = key
                .rsplit(':')
                .next()
                .and_then(|s| s.parse::<EntityType>().ok());
            match entity_type {
                Some(entity_type) => {
                    let sequence: u64 = decode(&key, &raw)?;
                    state.cursors.advance(entity_type, sequence);
                }
                None => warn!("忽略无法识别的游标键: {}", key),
            }
        }

        // Outbox 中有操作但缓存缺失的实体也要补出视图
        let mut keys_to_rebuild: Vec<EntityKey> = state.cache.keys().cloned().collect();
        for op in state.outbox.iter() {
            let key = op.key();
            if !state.cache.contains_key(&key) {
                keys_to_rebuild.push(key);
            }
        }
        for key in keys_to_rebuild {
            let entry = state.entry_or_new(&key);
            let rebuilt = state.rebuild_entry(entry, &mut batch)?;
            state.install_entry(key, rebuilt);
        }

        durable.commit(batch)?;

        info!(
            "本地存储已加载: outbox={} (恢复 {} 条发送中操作), cache={}",
            state.outbox.len(),
            recovered,
            state.cache.len()
        );

        Ok(Self {
            durable,
            state: Mutex::new(state),
        })
    }

    /// 追加一条操作并乐观更新缓存（同一批次原子提交）
    pub fn append_operation(&self, mut op: PendingOperation) -> Result<PendingOperation> {
        let mut state = self.state.lock();
        op.seq = state.outbox.next_seq();
        let key = op.key();

        let mut entry = state.entry_or_new(&key);
        let mut ops = state.outbox.for_entity(&key);
        ops.push(&op);
        entry.recompute(&ops);

        let mut batch = StoreBatch::new();
        batch.put_json(keys::outbox(op.seq), &op)?;
        batch.put_json(keys::cache(&key), &entry)?;
        self.durable.commit(batch)?;

        state.outbox.insert(op.clone());
        state.cache.insert(key, entry);
        debug!("Outbox 追加: {} seq={} {}", op.op_id, op.seq, op.kind);
        Ok(op)
    }

    /// 持久化操作的状态变化（不影响视图）
    pub fn update_operations(&self, ops: &[PendingOperation]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let mut batch = StoreBatch::new();
        for op in ops {
            if !state.outbox.contains(&op.op_id) {
                return Err(FintrackError::NotFound(format!("操作不在 Outbox 中: {}", op.op_id)));
            }
            batch.put_json(keys::outbox(op.seq), op)?;
        }
        self.durable.commit(batch)?;
        for op in ops {
            state.outbox.insert(op.clone());
        }
        Ok(())
    }

    pub fn update_operation(&self, op: &PendingOperation) -> Result<()> {
        self.update_operations(std::slice::from_ref(op))
    }

    /// 服务端确认成功：移除操作，写入权威状态
    ///
    /// 同一实体后续排队的操作都叠加在这次结果之上，所以它们的 base_revision 推进到 `revision`。
    pub fn complete_operation(
        &self,
        op_id: &str,
        revision: u64,
        data: Option<Value>,
    ) -> Result<LocalCacheEntry> {
        let mut state = self.state.lock();
        let op = state
            .outbox
            .get(op_id)
            .cloned()
            .ok_or_else(|| FintrackError::NotFound(format!("操作不在 Outbox 中: {}", op_id)))?;
        let key = op.key();

        let mut batch = StoreBatch::new();
        batch.delete(keys::outbox(op.seq));

        let rebased: Vec<PendingOperation> = state
            .outbox
            .for_entity(&key)
            .into_iter()
            .filter(|other| other.op_id != op.op_id)
            .map(|other| {
                let mut other = other.clone();
                other.base_revision = Some(revision);
                other
            })
            .collect();
        for other in &rebased {
            batch.put_json(keys::outbox(other.seq), other)?;
        }

        let mut entry = state.entry_or_new(&key);
        if !entry.has_revision_at_least(revision) {
            entry.server_revision = Some(revision);
            entry.server_data = data;
            entry.server_timestamp = Some(now_millis());
            entry.server_origin_op_id = Some(op.op_id.clone());
        }

        // 先在副本上计算视图，提交成功后再替换内存
        let rebased_refs: Vec<&PendingOperation> = rebased.iter().collect();
        entry.recompute(&rebased_refs);
        batch.put_json(keys::cache(&key), &entry)?;

        self.durable.commit(batch)?;

        state.outbox.remove(op_id);
        for other in rebased {
            state.outbox.insert(other);
        }
        state.cache.insert(key, entry.clone());
        Ok(entry)
    }

    /// 显式放弃一条操作（用户丢弃 / 冲突裁决远端胜出）
    pub fn discard_operation(&self, op_id: &str) -> Result<PendingOperation> {
        let mut state = self.state.lock();
        let op = state
            .outbox
            .get(op_id)
            .cloned()
            .ok_or_else(|| FintrackError::NotFound(format!("操作不在 Outbox 中: {}", op_id)))?;
        let key = op.key();

        let mut batch = StoreBatch::new();
        batch.delete(keys::outbox(op.seq));

        let remaining: Vec<&PendingOperation> = state
            .outbox
            .for_entity(&key)
            .into_iter()
            .filter(|other| other.op_id != op.op_id)
            .collect();
        let mut entry = state.entry_or_new(&key);
        entry.recompute(&remaining);
        let keep_entry = !(entry.is_settled() && entry.server_revision.is_none());
        if keep_entry {
            batch.put_json(keys::cache(&key), &entry)?;
        } else {
            batch.delete(keys::cache(&key));
        }

        self.durable.commit(batch)?;

        state.outbox.remove(op_id);
        state.install_entry(key, keep_entry.then_some(entry));
        Ok(op)
    }

    /// 应用服务端状态（变更流事件或冲突返回的当前值）
    ///
    /// revision 不新于本地时丢弃；`cursor` 不论是否丢弃都会推进。
    pub fn apply_server_state(
        &self,
        key: &EntityKey,
        server: ServerState,
        cursor: Option<u64>,
    ) -> Result<ServerStateOutcome> {
        let mut state = self.state.lock();
        let mut batch = StoreBatch::new();

        let mut cursors = state.cursors.clone();
        if let Some(sequence) = cursor {
            if cursors.advance(key.entity_type, sequence) {
                batch.put_json(keys::sync_cursor(key.entity_type), &sequence)?;
            }
        }

        let mut entry = state.entry_or_new(key);
        let outcome = if entry.has_revision_at_least(server.revision) {
            ServerStateOutcome::Stale
        } else {
            entry.server_revision = Some(server.revision);
            entry.server_data = server.data;
            entry.server_timestamp = server.timestamp;
            entry.server_origin_op_id = server.origin_op_id;
            if state.outbox.for_entity(key).is_empty() {
                ServerStateOutcome::Overwritten
            } else {
                ServerStateOutcome::Staged
            }
        };

        let rebuilt = if outcome == ServerStateOutcome::Stale {
            None
        } else {
            Some(state.rebuild_entry(entry, &mut batch)?)
        };

        if !batch.is_empty() {
            self.durable.commit(batch)?;
        }

        state.cursors = cursors;
        if let Some(rebuilt) = rebuilt {
            state.install_entry(key.clone(), rebuilt);
        }
        Ok(outcome)
    }

    /// 清空 Outbox、本地缓存与游标（破坏性操作）
    pub fn reset_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.durable.clear()?;
        let mut batch = StoreBatch::new();
        batch.put_json(keys::LAYOUT_VERSION, &STORE_LAYOUT_VERSION)?;
        self.durable.commit(batch)?;
        state.outbox.clear();
        state.cache.clear();
        state.cursors.clear();
        warn!("本地数据已清空");
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.durable.flush()
    }

    pub fn entry(&self, key: &EntityKey) -> Option<LocalCacheEntry> {
        self.state.lock().cache.get(key).cloned()
    }

    pub fn merged_view(&self, key: &EntityKey) -> Option<Value> {
        self.state
            .lock()
            .cache
            .get(key)
            .and_then(|entry| entry.merged_view.clone())
    }

    pub fn entries(&self) -> Vec<LocalCacheEntry> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.cache.values().cloned().collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        entries
    }

    pub fn operation(&self, op_id: &str) -> Option<PendingOperation> {
        self.state.lock().outbox.get(op_id).cloned()
    }

    /// FIFO 顺序
    pub fn operations(&self) -> Vec<PendingOperation> {
        self.state.lock().outbox.iter().cloned().collect()
    }

    pub fn operations_for(&self, key: &EntityKey) -> Vec<PendingOperation> {
        self.state
            .lock()
            .outbox
            .for_entity(key)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn failed_operations(&self) -> Vec<PendingOperation> {
        self.state
            .lock()
            .outbox
            .iter()
            .filter(|op| op.is_failed())
            .cloned()
            .collect()
    }

    pub fn select_ready(&self, now: i64, limit: usize) -> Vec<PendingOperation> {
        self.state.lock().outbox.select_ready(now, limit)
    }

    pub fn earliest_retry_at(&self) -> Option<i64> {
        self.state.lock().outbox.earliest_retry_at()
    }

    pub fn has_unresolved_ops(&self, key: &EntityKey) -> bool {
        !self.state.lock().outbox.for_entity(key).is_empty()
    }

    pub fn stats(&self) -> OutboxStats {
        self.state.lock().outbox.stats()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().outbox.len()
    }

    pub fn cursors(&self) -> SyncCursors {
        self.state.lock().cursors.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (Arc<MemoryStore>, StorageManager) {
        let durable = Arc::new(MemoryStore::new());
        let manager = StorageManager::open(durable.clone()).unwrap();
        (durable, manager)
    }

    fn update(id: &str, amount: i64, base: Option<u64>) -> PendingOperation {
        PendingOperation::new(EntityType::Budget, id, OperationKind::Update, json!({"amount": amount}), base)
    }

    fn budget(id: &str) -> EntityKey {
        EntityKey::new(EntityType::Budget, id)
    }

    #[test]
    fn test_append_updates_view_and_persists() {
        let (durable, manager) = manager();
        let op = manager.append_operation(update("budget-7", 100, None)).unwrap();

        assert_eq!(manager.merged_view(&budget("budget-7")), Some(json!({"amount": 100})));
        assert_eq!(manager.pending_count(), 1);
        assert!(durable.get(&keys::outbox(op.seq)).unwrap().is_some());
        assert!(durable.get(&keys::cache(&budget("budget-7"))).unwrap().is_some());
    }

    #[test]
    fn test_storage_failure_leaves_memory_untouched() {
        let (durable, manager) = manager();
        durable.set_fail_writes(true);
        let err = manager.append_operation(update("budget-7", 100, None)).unwrap_err();
        assert!(matches!(err, FintrackError::Storage(_)));
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.entry(&budget("budget-7")).is_none());
    }

    #[test]
    fn test_complete_rebases_following_ops() {
        let (_, manager) = manager();
        let first = manager.append_operation(update("budget-7", 100, None)).unwrap();
        let second = manager.append_operation(update("budget-7", 150, None)).unwrap();

        let entry = manager
            .complete_operation(&first.op_id, 1, Some(json!({"amount": 100})))
            .unwrap();
        assert_eq!(entry.server_revision, Some(1));
        assert_eq!(entry.pending_op_ids, vec![second.op_id.clone()]);
        assert_eq!(entry.merged_view, Some(json!({"amount": 150})));
        assert_eq!(manager.operation(&second.op_id).unwrap().base_revision, Some(1));
    }

    #[test]
    fn test_server_state_staged_under_pending_op() {
        let (_, manager) = manager();
        manager.append_operation(update("budget-7", 150, None)).unwrap();

        let outcome = manager
            .apply_server_state(
                &budget("budget-7"),
                ServerState {
                    revision: 4,
                    data: Some(json!({"amount": 10, "name": "food"})),
                    timestamp: Some(1),
                    origin_op_id: None,
                },
                Some(9),
            )
            .unwrap();
        assert_eq!(outcome, ServerStateOutcome::Staged);
        let entry = manager.entry(&budget("budget-7")).unwrap();
        assert_eq!(entry.server_data, Some(json!({"amount": 10, "name": "food"})));
        assert_eq!(entry.merged_view, Some(json!({"amount": 150, "name": "food"})));
        assert_eq!(manager.cursors().get(EntityType::Budget), 9);
    }

    #[test]
    fn test_stale_server_state_dropped_but_cursor_advances() {
        let (_, manager) = manager();
        let state = |revision| ServerState {
            revision,
            data: Some(json!({"amount": revision})),
            timestamp: None,
            origin_op_id: None,
        };
        let key = budget("budget-7");
        assert_eq!(
            manager.apply_server_state(&key, state(5), Some(1)).unwrap(),
            ServerStateOutcome::Overwritten
        );
        assert_eq!(
            manager.apply_server_state(&key, state(5), Some(2)).unwrap(),
            ServerStateOutcome::Stale
        );
        assert_eq!(
            manager.apply_server_state(&key, state(4), Some(3)).unwrap(),
            ServerStateOutcome::Stale
        );
        assert_eq!(manager.merged_view(&key), Some(json!({"amount": 5})));
        assert_eq!(manager.cursors().get(EntityType::Budget), 3);
    }

    #[test]
    fn test_discard_create_removes_entry() {
        let (_, manager) = manager();
        let op = manager
            .append_operation(PendingOperation::new(
                EntityType::Transaction,
                "tx-1",
                OperationKind::Create,
                json!({"amount": 12}),
                None,
            ))
            .unwrap();
        manager.discard_operation(&op.op_id).unwrap();
        assert!(manager.entry(&EntityKey::new(EntityType::Transaction, "tx-1")).is_none());
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_reopen_recovers_in_flight_ops() {
        let durable = Arc::new(MemoryStore::new());
        let op_id = {
            let manager = StorageManager::open(durable.clone()).unwrap();
            let mut op = manager.append_operation(update("budget-7", 100, None)).unwrap();
            op.mark_dispatching();
            manager.update_operation(&op).unwrap();
            manager
                .apply_server_state(
                    &budget("budget-1"),
                    ServerState { revision: 2, data: Some(json!({})), timestamp: None, origin_op_id: None },
                    Some(7),
                )
                .unwrap();
            op.op_id
        };

        let manager = StorageManager::open(durable).unwrap();
        let op = manager.operation(&op_id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(manager.merged_view(&budget("budget-7")), Some(json!({"amount": 100})));
        assert_eq!(manager.cursors().get(EntityType::Budget), 7);
        assert_eq!(manager.select_ready(i64::MAX, 10).len(), 1);
    }

    #[test]
    fn test_reset_all() {
        let (durable, manager) = manager();
        manager.append_operation(update("budget-7", 100, None)).unwrap();
        manager.reset_all().unwrap();
        assert_eq!(manager.pending_count(), 0);
        assert!(manager.entries().is_empty());
        assert!(durable.scan_prefix(keys::OUTBOX).unwrap().is_empty());
    }
}
