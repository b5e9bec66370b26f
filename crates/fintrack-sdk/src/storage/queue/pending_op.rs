use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureReason;
use crate::remote::RemoteOperation;
use crate::sync::{EntityKey, EntityType};
use crate::utils::time::now_millis;

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// 等待发送
    Pending,
    /// 正在发送（同一实体同一时刻至多一个）
    Dispatching,
    /// 失败，等待用户重试或丢弃
    Failed,
    /// 冲突，正在按策略裁决
    Conflicted,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "等待发送"),
            OperationStatus::Dispatching => write!(f, "正在发送"),
            OperationStatus::Failed => write!(f, "发送失败"),
            OperationStatus::Conflicted => write!(f, "冲突"),
        }
    }
}

/// Outbox 中的一条待确认变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// 客户端生成的全局唯一 ID，服务端据此幂等
    pub op_id: String,
    /// Outbox 插入序号（FIFO）
    pub seq: u64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: OperationKind,
    /// 部分字段
    pub payload: Value,
    /// 本地最后观察到的服务端 revision
    pub base_revision: Option<u64>,
    /// 创建时间（UTC 毫秒）
    pub created_at: i64,
    pub attempts: u32,
    /// 下次可发送时间（UTC 毫秒）
    pub next_retry_at: i64,
    pub status: OperationStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
}

impl PendingOperation {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        kind: OperationKind,
        payload: Value,
        base_revision: Option<u64>,
    ) -> Self {
        let now = now_millis();
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            entity_type,
            entity_id: entity_id.into(),
            kind,
            payload,
            base_revision,
            created_at: now,
            attempts: 0,
            next_retry_at: now,
            status: OperationStatus::Pending,
            last_error: None,
            failure_reason: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// 是否可以在 `now` 时刻发送
    pub fn is_ready(&self, now: i64) -> bool {
        self.status == OperationStatus::Pending && self.next_retry_at <= now
    }

    /// 仍在 Outbox 中且未被用户处理的失败操作
    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }

    pub fn mark_dispatching(&mut self) {
        self.status = OperationStatus::Dispatching;
    }

    pub fn mark_conflicted(&mut self) {
        self.status = OperationStatus::Conflicted;
    }

    /// 记录一次失败并安排下次重试
    pub fn schedule_retry(&mut self, next_retry_at: i64, reason: FailureReason) {
        self.status = OperationStatus::Pending;
        self.next_retry_at = next_retry_at;
        self.last_error = Some(reason.to_string());
        self.failure_reason = Some(reason);
    }

    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.status = OperationStatus::Failed;
        self.last_error = Some(reason.to_string());
        self.failure_reason = Some(reason);
    }

    /// 用户手动重试：清零尝试次数，立即可发送
    pub fn reset_for_retry(&mut self, now: i64) {
        self.status = OperationStatus::Pending;
        self.attempts = 0;
        self.next_retry_at = now;
        self.last_error = None;
        self.failure_reason = None;
    }

    /// 重启恢复：结果不明的发送中操作回到待发送，依赖 op_id 幂等重投
    pub fn recover_after_restart(&mut self) -> bool {
        if matches!(self.status, OperationStatus::Dispatching | OperationStatus::Conflicted) {
            self.status = OperationStatus::Pending;
            return true;
        }
        false
    }

    pub fn to_remote(&self) -> RemoteOperation {
        RemoteOperation {
            op_id: self.op_id.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
            base_revision: self.base_revision,
        }
    }
}
