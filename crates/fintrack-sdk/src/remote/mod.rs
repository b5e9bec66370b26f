//! 远端存储接口
//!
//! 同步核心只通过 `RemoteStore` 与服务端交互：批量提交变更、订阅变更流。
//! 服务端的 schema、鉴权与传输协议都在这一层之外。

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::storage::OperationKind;
use crate::sync::{EntityKey, EntityType, SyncCursors};

pub mod http;
pub mod memory;

pub use http::HttpRemoteStore;
pub use memory::{MemoryRemoteStore, RemoteFault};

/// 发往服务端的一条变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOperation {
    pub op_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: OperationKind,
    pub payload: Value,
    pub base_revision: Option<u64>,
}

impl RemoteOperation {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// 单条变更的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied {
        revision: u64,
        data: Option<Value>,
    },
    /// base_revision 已过期
    Conflict {
        current_revision: u64,
        current_data: Option<Value>,
        /// 造成冲突的服务端状态写入时间（UTC 毫秒）
        #[serde(default)]
        server_timestamp: Option<i64>,
        #[serde(default)]
        origin_op_id: Option<String>,
    },
    /// 服务端校验失败，不可重试
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub op_id: String,
    #[serde(flatten)]
    pub outcome: ApplyOutcome,
}

/// 变更流中的一条服务端变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// 实体级单调递增
    pub revision: u64,
    /// None 表示实体已删除
    pub data: Option<Value>,
    pub server_timestamp: i64,
    /// 该实体类型变更流中的位置，游标据此恢复
    pub sequence: u64,
    #[serde(default)]
    pub origin_op_id: Option<String>,
}

impl RemoteChange {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}

/// 变更流：至少一次投递，同一实体按 revision 有序
pub type ChangeStream = BoxStream<'static, Result<RemoteChange>>;

#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    /// 批量提交；同一 op_id 重复提交必须是幂等的
    async fn apply_batch(&self, ops: Vec<RemoteOperation>) -> Result<Vec<ApplyResult>>;

    /// 从 `from` 之后订阅指定类型的变更
    async fn subscribe_changes(
        &self,
        entity_types: &[EntityType],
        from: &SyncCursors,
    ) -> Result<ChangeStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_result_wire_format() {
        let result = ApplyResult {
            op_id: "op-1".to_string(),
            outcome: ApplyOutcome::Conflict {
                current_revision: 5,
                current_data: Some(json!({"amount": 1})),
                server_timestamp: Some(10),
                origin_op_id: None,
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["op_id"], "op-1");
        assert_eq!(value["outcome"], "conflict");
        assert_eq!(value["current_revision"], 5);

        let parsed: ApplyResult = serde_json::from_value(json!({
            "op_id": "op-2",
            "outcome": "applied",
            "revision": 3,
            "data": {"amount": 2}
        }))
        .unwrap();
        assert_eq!(
            parsed.outcome,
            ApplyOutcome::Applied { revision: 3, data: Some(json!({"amount": 2})) }
        );
    }

    #[test]
    fn remote_change_defaults_origin() {
        let change: RemoteChange = serde_json::from_value(json!({
            "entity_type": "budget",
            "entity_id": "budget-7",
            "revision": 2,
            "data": null,
            "server_timestamp": 1,
            "sequence": 8
        }))
        .unwrap();
        assert_eq!(change.origin_op_id, None);
        assert_eq!(change.key(), EntityKey::new(EntityType::Budget, "budget-7"));
    }
}
