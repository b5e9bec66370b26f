//! 内存版远端存储
//!
//! 行为与真实服务端约定一致：op_id 幂等、按 revision 检测冲突、
//! 每个实体类型一条带 sequence 的变更日志。另外支持故障注入和“其他设备”的写入，
//! 用于离线场景测试与本地演示。

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{FintrackError, Result};
use crate::remote::{ApplyOutcome, ApplyResult, ChangeStream, RemoteChange, RemoteOperation, RemoteStore};
use crate::storage::entities::apply_operation;
use crate::storage::OperationKind;
use crate::sync::{EntityKey, EntityType, SyncCursors};
use crate::utils::time::now_millis;

/// 注入到下一次 `apply_batch` 的故障
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFault {
    /// 永不返回，由调用方超时
    Hang,
    /// 连接失败，什么都没应用
    Network,
    /// 全部应用后丢失响应（结果不明）
    DropResponse,
    /// 会话过期
    Auth,
    /// 整批被拒绝
    RejectBatch(String),
}

#[derive(Debug, Clone)]
struct EntityRecord {
    revision: u64,
    data: Option<Value>,
    updated_at: i64,
    origin_op_id: Option<String>,
}

#[derive(Debug, Default)]
struct RemoteState {
    entities: HashMap<EntityKey, EntityRecord>,
    /// op_id → 已应用结果（幂等）
    applied: HashMap<String, ApplyOutcome>,
    log: Vec<RemoteChange>,
    sequences: HashMap<EntityType, u64>,
    faults: VecDeque<RemoteFault>,
    rejected_entities: HashMap<String, String>,
    apply_calls: usize,
    received: Vec<Vec<RemoteOperation>>,
}

impl RemoteState {
    fn append_change(&mut self, key: &EntityKey, record: &EntityRecord) -> RemoteChange {
        let sequence = self.sequences.entry(key.entity_type).or_insert(0);
        *sequence += 1;
        let change = RemoteChange {
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            revision: record.revision,
            data: record.data.clone(),
            server_timestamp: record.updated_at,
            sequence: *sequence,
            origin_op_id: record.origin_op_id.clone(),
        };
        self.log.push(change.clone());
        change
    }

    fn apply_one(&mut self, op: &RemoteOperation) -> (ApplyOutcome, Option<RemoteChange>) {
        if let Some(outcome) = self.applied.get(&op.op_id) {
            debug!("重复投递 op_id={}，返回首次结果", op.op_id);
            return (outcome.clone(), None);
        }
        if let Some(reason) = self.rejected_entities.get(&op.entity_id) {
            return (ApplyOutcome::Rejected { reason: reason.clone() }, None);
        }
        if op.kind != OperationKind::Delete && !op.payload.is_object() {
            return (
                ApplyOutcome::Rejected { reason: "payload 必须是对象".to_string() },
                None,
            );
        }

        let key = op.key();
        let current = self.entities.get(&key).cloned();
        match (&current, op.kind) {
            (None, OperationKind::Update | OperationKind::Delete) => {
                return (
                    ApplyOutcome::Rejected { reason: format!("实体不存在: {}", key) },
                    None,
                );
            }
            (Some(record), _) if op.base_revision != Some(record.revision) => {
                return (
                    ApplyOutcome::Conflict {
                        current_revision: record.revision,
                        current_data: record.data.clone(),
                        server_timestamp: Some(record.updated_at),
                        origin_op_id: record.origin_op_id.clone(),
                    },
                    None,
                );
            }
            _ => {}
        }

        let record = EntityRecord {
            revision: current.as_ref().map_or(1, |r| r.revision + 1),
            data: apply_operation(current.and_then(|r| r.data), op.kind, &op.payload),
            updated_at: now_millis(),
            origin_op_id: Some(op.op_id.clone()),
        };
        let change = self.append_change(&key, &record);
        let outcome = ApplyOutcome::Applied {
            revision: record.revision,
            data: record.data.clone(),
        };
        self.entities.insert(key, record);
        self.applied.insert(op.op_id.clone(), outcome.clone());
        (outcome, Some(change))
    }
}

#[derive(Debug)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    feed: broadcast::Sender<RemoteChange>,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(RemoteState::default()),
            feed,
            latency: Mutex::new(None),
        }
    }

    /// 依次注入到后续的 `apply_batch`
    pub fn inject_fault(&self, fault: RemoteFault) {
        self.state.lock().faults.push_back(fault);
    }

    pub fn inject_faults(&self, fault: RemoteFault, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.faults.push_back(fault.clone());
        }
    }

    /// 指定实体的变更一律拒绝
    pub fn reject_entity(&self, entity_id: impl Into<String>, reason: impl Into<String>) {
        self.state
            .lock()
            .rejected_entities
            .insert(entity_id.into(), reason.into());
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// 模拟其他设备写入；`data` 为 None 表示删除
    pub fn external_write(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        data: Option<Value>,
        timestamp: i64,
    ) -> RemoteChange {
        let key = EntityKey::new(entity_type, entity_id);
        let change = {
            let mut state = self.state.lock();
            let revision = state.entities.get(&key).map_or(1, |r| r.revision + 1);
            let record = EntityRecord {
                revision,
                data,
                updated_at: timestamp,
                origin_op_id: None,
            };
            let change = state.append_change(&key, &record);
            state.entities.insert(key, record);
            change
        };
        let _ = self.feed.send(change.clone());
        change
    }

    /// 服务端当前的 (revision, data)
    pub fn entity(&self, entity_type: EntityType, entity_id: &str) -> Option<(u64, Option<Value>)> {
        self.state
            .lock()
            .entities
            .get(&EntityKey::new(entity_type, entity_id))
            .map(|r| (r.revision, r.data.clone()))
    }

    pub fn apply_calls(&self) -> usize {
        self.state.lock().apply_calls
    }

    /// 收到的批次（含故障批次），按到达顺序
    pub fn received_batches(&self) -> Vec<Vec<RemoteOperation>> {
        self.state.lock().received.clone()
    }

    pub fn change_log(&self) -> Vec<RemoteChange> {
        self.state.lock().log.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn apply_batch(&self, ops: Vec<RemoteOperation>) -> Result<Vec<ApplyResult>> {
        let latency = *self.latency.lock();
        let fault = {
            let mut state = self.state.lock();
            state.apply_calls += 1;
            state.received.push(ops.clone());
            state.faults.pop_front()
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match fault {
            Some(RemoteFault::Hang) => return futures::future::pending().await,
            Some(RemoteFault::Network) => {
                return Err(FintrackError::Network("connection reset by peer".to_string()));
            }
            Some(RemoteFault::Auth) => {
                return Err(FintrackError::Auth("session expired".to_string()));
            }
            Some(RemoteFault::RejectBatch(reason)) => {
                return Err(FintrackError::Validation(reason));
            }
            Some(RemoteFault::DropResponse) | None => {}
        }

        let (results, changes) = {
            let mut state = self.state.lock();
            let mut results = Vec::with_capacity(ops.len());
            let mut changes = Vec::new();
            for op in &ops {
                let (outcome, change) = state.apply_one(op);
                results.push(ApplyResult {
                    op_id: op.op_id.clone(),
                    outcome,
                });
                changes.extend(change);
            }
            (results, changes)
        };

        for change in changes {
            let _ = self.feed.send(change);
        }

        if fault == Some(RemoteFault::DropResponse) {
            info!("模拟响应丢失: {} 条变更已应用", results.len());
            return Err(FintrackError::Network("response lost".to_string()));
        }
        Ok(results)
    }

    async fn subscribe_changes(
        &self,
        entity_types: &[EntityType],
        from: &SyncCursors,
    ) -> Result<ChangeStream> {
        let types: HashSet<EntityType> = entity_types.iter().copied().collect();
        let cursors = from.clone();

        // 先订阅再取积压，避免两者之间的事件丢失；重复由调用方按 revision 去重
        let (receiver, backlog) = {
            let state = self.state.lock();
            let receiver = self.feed.subscribe();
            let backlog: Vec<Result<RemoteChange>> = state
                .log
                .iter()
                .filter(|c| types.contains(&c.entity_type) && c.sequence > cursors.get(c.entity_type))
                .cloned()
                .map(Ok)
                .collect();
            (receiver, backlog)
        };

        let live = stream::unfold((receiver, types), |(mut receiver, types)| async move {
            loop {
                match receiver.recv().await {
                    Ok(change) if types.contains(&change.entity_type) => {
                        return Some((Ok(change), (receiver, types)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let err = FintrackError::Network(format!("变更流落后 {} 条", skipped));
                        return Some((Err(err), (receiver, types)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(backlog).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(id: &str, kind: OperationKind, payload: Value, base: Option<u64>) -> RemoteOperation {
        RemoteOperation {
            op_id: uuid::Uuid::new_v4().to_string(),
            entity_type: EntityType::Transaction,
            entity_id: id.to_string(),
            kind,
            payload,
            base_revision: base,
        }
    }

    #[tokio::test]
    async fn test_same_op_id_applied_once() {
        let remote = MemoryRemoteStore::new();
        let create = op("tx-1", OperationKind::Create, json!({"amount": 5}), None);

        let first = remote.apply_batch(vec![create.clone()]).await.unwrap();
        let second = remote.apply_batch(vec![create]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(remote.entity(EntityType::Transaction, "tx-1").unwrap().0, 1);
        assert_eq!(remote.change_log().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_base_revision_conflicts() {
        let remote = MemoryRemoteStore::new();
        remote
            .apply_batch(vec![op("tx-1", OperationKind::Create, json!({"amount": 5}), None)])
            .await
            .unwrap();
        remote.external_write(EntityType::Transaction, "tx-1", Some(json!({"amount": 6})), 99);

        let results = remote
            .apply_batch(vec![op("tx-1", OperationKind::Update, json!({"amount": 7}), Some(1))])
            .await
            .unwrap();
        match &results[0].outcome {
            ApplyOutcome::Conflict { current_revision, server_timestamp, .. } => {
                assert_eq!(*current_revision, 2);
                assert_eq!(*server_timestamp, Some(99));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_of_missing_entity_rejected() {
        let remote = MemoryRemoteStore::new();
        let results = remote
            .apply_batch(vec![op("tx-9", OperationKind::Update, json!({"amount": 1}), None)])
            .await
            .unwrap();
        assert!(matches!(results[0].outcome, ApplyOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_drop_response_still_applies() {
        let remote = MemoryRemoteStore::new();
        remote.inject_fault(RemoteFault::DropResponse);
        let create = op("tx-1", OperationKind::Create, json!({"amount": 5}), None);

        assert!(remote.apply_batch(vec![create.clone()]).await.is_err());
        let retried = remote.apply_batch(vec![create]).await.unwrap();
        assert_eq!(
            retried[0].outcome,
            ApplyOutcome::Applied { revision: 1, data: Some(json!({"amount": 5})) }
        );
        assert_eq!(remote.apply_calls(), 2);
    }

    #[tokio::test]
    async fn test_subscription_replays_after_cursor_then_goes_live() {
        let remote = MemoryRemoteStore::new();
        remote.external_write(EntityType::Budget, "b-1", Some(json!({"amount": 1})), 1);
        remote.external_write(EntityType::Budget, "b-1", Some(json!({"amount": 2})), 2);
        remote.external_write(EntityType::Account, "a-1", Some(json!({"name": "cash"})), 3);

        let mut cursors = SyncCursors::new();
        cursors.advance(EntityType::Budget, 1);
        let mut stream = remote
            .subscribe_changes(&[EntityType::Budget], &cursors)
            .await
            .unwrap();

        let replayed = stream.next().await.unwrap().unwrap();
        assert_eq!((replayed.revision, replayed.sequence), (2, 2));

        remote.external_write(EntityType::Account, "a-1", Some(json!({"name": "bank"})), 4);
        remote.external_write(EntityType::Budget, "b-1", None, 5);
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.entity_type, EntityType::Budget);
        assert_eq!(live.revision, 3);
        assert_eq!(live.data, None);
    }
}
