use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::sync::EntityKey;

pub mod pending_op;
pub mod retry_policy;

// 重新导出核心类型
pub use pending_op::{OperationKind, OperationStatus, PendingOperation};
pub use retry_policy::{BackoffController, RetryPolicy};

/// Outbox 统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub total: usize,
    pub pending: usize,
    pub dispatching: usize,
    pub failed: usize,
    pub conflicted: usize,
    pub entities: usize,
}

/// Outbox 内存索引：按插入序号 FIFO，同时按实体索引
///
/// 持久化由 `StorageManager` 负责，这里只维护顺序与索引。
#[derive(Debug, Default)]
pub struct Outbox {
    ops: BTreeMap<u64, PendingOperation>,
    by_op_id: HashMap<String, u64>,
    by_entity: HashMap<EntityKey, BTreeSet<u64>>,
    next_seq: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从持久化记录重建索引
    pub fn from_operations(ops: impl IntoIterator<Item = PendingOperation>) -> Self {
        let mut outbox = Self::new();
        for op in ops {
            outbox.insert(op);
        }
        outbox
    }

    /// 下一个可用的插入序号
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// 插入（或按 seq 覆盖）一条操作
    pub fn insert(&mut self, op: PendingOperation) {
        let seq = op.seq;
        self.next_seq = self.next_seq.max(seq + 1);
        self.by_op_id.insert(op.op_id.clone(), seq);
        self.by_entity.entry(op.key()).or_default().insert(seq);
        self.ops.insert(seq, op);
    }

    pub fn get(&self, op_id: &str) -> Option<&PendingOperation> {
        self.by_op_id.get(op_id).and_then(|seq| self.ops.get(seq))
    }

    pub fn contains(&self, op_id: &str) -> bool {
        self.by_op_id.contains_key(op_id)
    }

    pub fn remove(&mut self, op_id: &str) -> Option<PendingOperation> {
        let seq = self.by_op_id.remove(op_id)?;
        let op = self.ops.remove(&seq)?;
        let key = op.key();
        if let Some(seqs) = self.by_entity.get_mut(&key) {
            seqs.remove(&seq);
            if seqs.is_empty() {
                self.by_entity.remove(&key);
            }
        }
        Some(op)
    }

    /// 某实体的全部操作，按提交顺序
    pub fn for_entity(&self, key: &EntityKey) -> Vec<&PendingOperation> {
        self.by_entity
            .get(key)
            .map(|seqs| seqs.iter().filter_map(|seq| self.ops.get(seq)).collect())
            .unwrap_or_default()
    }

    /// 选出每个实体最早的一条就绪操作
    ///
    /// 实体队头不是就绪的 Pending（发送中 / 退避中 / 失败待处理）时，整个实体跳过，
    /// 保证同一实体的后续操作不会越过前面的操作。
    pub fn select_ready(&self, now: i64, limit: usize) -> Vec<PendingOperation> {
        let mut seen: HashSet<EntityKey> = HashSet::new();
        let mut batch = Vec::new();

        for op in self.ops.values() {
            if batch.len() >= limit {
                break;
            }
            let key = op.key();
            if !seen.insert(key) {
                continue;
            }
            if op.is_ready(now) {
                batch.push(op.clone());
            }
        }

        batch
    }

    /// 所有实体队头中最早的退避截止时间
    pub fn earliest_retry_at(&self) -> Option<i64> {
        self.by_entity
            .values()
            .filter_map(|seqs| seqs.iter().next())
            .filter_map(|seq| self.ops.get(seq))
            .filter(|op| op.status == OperationStatus::Pending)
            .map(|op| op.next_retry_at)
            .min()
    }

    /// FIFO 顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.ops.values()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.by_op_id.clear();
        self.by_entity.clear();
    }

    pub fn stats(&self) -> OutboxStats {
        let mut stats = OutboxStats {
            total: self.ops.len(),
            entities: self.by_entity.len(),
            ..OutboxStats::default()
        };
        for op in self.ops.values() {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Dispatching => stats.dispatching += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Conflicted => stats.conflicted += 1,
            }
        }
        stats
    }
}
