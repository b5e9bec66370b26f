//! 本地缓存实体
//!
//! `merged_view` 永远由 `server_data` + 按提交顺序排列的待确认操作推导，
//! 不允许直接修改。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::queue::{OperationKind, PendingOperation};
use crate::sync::{EntityKey, EntityType};

/// 本地缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalCacheEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// 已知的服务端 revision（None 表示服务端尚无此实体）
    pub server_revision: Option<u64>,
    /// 服务端权威数据（None 表示不存在或已删除）
    pub server_data: Option<Value>,
    /// 最后一次服务端变更的时间戳（UTC 毫秒），供冲突裁决使用
    #[serde(default)]
    pub server_timestamp: Option<i64>,
    /// 最后一次服务端变更的来源 op_id
    #[serde(default)]
    pub server_origin_op_id: Option<String>,
    /// 仍在 Outbox 中的操作，按提交顺序
    pub pending_op_ids: Vec<String>,
    /// 读取方看到的视图
    pub merged_view: Option<Value>,
}

impl LocalCacheEntry {
    pub fn new(key: &EntityKey) -> Self {
        Self {
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            server_revision: None,
            server_data: None,
            server_timestamp: None,
            server_origin_op_id: None,
            pending_op_ids: Vec::new(),
            merged_view: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// 按当前待确认操作重新计算 `pending_op_ids` 与 `merged_view`
    pub fn recompute(&mut self, ops: &[&PendingOperation]) {
        self.pending_op_ids = ops.iter().map(|op| op.op_id.clone()).collect();
        self.merged_view = merged_view(self.server_data.as_ref(), ops.iter().copied());
    }

    /// 没有任何待确认操作
    pub fn is_settled(&self) -> bool {
        self.pending_op_ids.is_empty()
    }

    /// 服务端是否已有比 `revision` 更新（或相同）的状态
    pub fn has_revision_at_least(&self, revision: u64) -> bool {
        self.server_revision.map_or(false, |current| current >= revision)
    }
}

/// 在 `base` 上依次叠加操作
pub fn merged_view<'a>(
    base: Option<&Value>,
    ops: impl IntoIterator<Item = &'a PendingOperation>,
) -> Option<Value> {
    ops.into_iter()
        .fold(base.cloned(), |view, op| apply_operation(view, op.kind, &op.payload))
}

/// create 整体替换，update 浅合并字段，delete 置为不存在
pub fn apply_operation(view: Option<Value>, kind: OperationKind, payload: &Value) -> Option<Value> {
    match kind {
        OperationKind::Create => Some(payload.clone()),
        OperationKind::Delete => None,
        OperationKind::Update => match (view, payload) {
            (Some(Value::Object(mut current)), Value::Object(fields)) => {
                for (field, value) in fields {
                    current.insert(field.clone(), value.clone());
                }
                Some(Value::Object(current))
            }
            (_, payload) => Some(payload.clone()),
        },
    }
}
