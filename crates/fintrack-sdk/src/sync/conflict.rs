//! 冲突裁决策略
//!
//! 默认策略为最后写入胜出：比较本地操作的 `(created_at, op_id)` 与造成冲突的
//! 服务端写入的 `(server_timestamp, origin_op_id)`。

use std::fmt::Debug;

use serde_json::Value;

use crate::events::ConflictWinner;
use crate::storage::PendingOperation;

/// 冲突时服务端的当前状态
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictContext {
    pub current_revision: u64,
    pub current_data: Option<Value>,
    /// 服务端写入时间（UTC 毫秒），未知时为 None
    pub server_timestamp: Option<i64>,
    pub origin_op_id: Option<String>,
}

/// 冲突裁决策略
pub trait ConflictPolicy: Send + Sync + Debug {
    fn resolve(&self, local: &PendingOperation, remote: &ConflictContext) -> ConflictWinner;
}

/// 最后写入胜出，op_id 字典序打破平局
///
/// 服务端时间未知时远端胜出。
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictPolicy for LastWriteWins {
    fn resolve(&self, local: &PendingOperation, remote: &ConflictContext) -> ConflictWinner {
        let Some(server_timestamp) = remote.server_timestamp else {
            return ConflictWinner::Remote;
        };

        let local_key = (local.created_at, local.op_id.as_str());
        let remote_key = (server_timestamp, remote.origin_op_id.as_deref().unwrap_or(""));
        if local_key > remote_key {
            ConflictWinner::Local
        } else {
            ConflictWinner::Remote
        }
    }
}

/// 总是保留服务端状态
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ConflictPolicy for RemoteWins {
    fn resolve(&self, _local: &PendingOperation, _remote: &ConflictContext) -> ConflictWinner {
        ConflictWinner::Remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OperationKind;
    use crate::sync::EntityType;
    use serde_json::json;

    fn local(created_at: i64, op_id: &str) -> PendingOperation {
        let mut op = PendingOperation::new(
            EntityType::Budget,
            "budget-7",
            OperationKind::Update,
            json!({"amount": 150}),
            Some(3),
        );
        op.created_at = created_at;
        op.op_id = op_id.to_string();
        op
    }

    fn remote(server_timestamp: Option<i64>, origin: Option<&str>) -> ConflictContext {
        ConflictContext {
            current_revision: 5,
            current_data: Some(json!({"amount": 90})),
            server_timestamp,
            origin_op_id: origin.map(str::to_string),
        }
    }

    #[test]
    fn test_later_write_wins() {
        let policy = LastWriteWins;
        assert_eq!(policy.resolve(&local(100, "a"), &remote(Some(200), None)), ConflictWinner::Remote);
        assert_eq!(policy.resolve(&local(300, "a"), &remote(Some(200), None)), ConflictWinner::Local);
    }

    #[test]
    fn test_op_id_breaks_ties() {
        let policy = LastWriteWins;
        assert_eq!(
            policy.resolve(&local(200, "op-b"), &remote(Some(200), Some("op-a"))),
            ConflictWinner::Local
        );
        assert_eq!(
            policy.resolve(&local(200, "op-a"), &remote(Some(200), Some("op-b"))),
            ConflictWinner::Remote
        );
    }

    #[test]
    fn test_unknown_server_time_keeps_remote() {
        assert_eq!(LastWriteWins.resolve(&local(i64::MAX, "z"), &remote(None, None)), ConflictWinner::Remote);
        assert_eq!(RemoteWins.resolve(&local(i64::MAX, "z"), &remote(Some(0), None)), ConflictWinner::Remote);
    }
}
