//! 本地变更记录
//!
//! 把 UI 层的 create/update/delete 意图变成一条 `PendingOperation`，
//! 与乐观视图更新一起原子写入本地存储，然后唤醒调度器。从不等待网络。

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, instrument};

use crate::error::{FintrackError, Result};
use crate::events::SyncEvent;
use crate::storage::{OperationKind, PendingOperation};
use crate::sync::{EntityKey, EntityType, SyncContext};

#[derive(Debug, Clone)]
pub struct MutationRecorder {
    ctx: Arc<SyncContext>,
}

impl MutationRecorder {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// 记录一次本地变更，返回 op_id
    ///
    /// 只有本地存储写入失败时才返回错误，此时变更没有被捕获，调用方必须告知用户。
    #[instrument(skip(self, payload))]
    pub async fn record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: OperationKind,
        payload: Value,
    ) -> Result<String> {
        if entity_id.trim().is_empty() {
            return Err(FintrackError::InvalidArgument("entity_id 不能为空".to_string()));
        }
        let payload = match kind {
            OperationKind::Delete => Value::Null,
            _ if payload.is_object() => payload,
            _ => {
                return Err(FintrackError::InvalidArgument(format!(
                    "{} 的 payload 必须是 JSON 对象",
                    kind
                )))
            }
        };

        let op = {
            let key = EntityKey::new(entity_type, entity_id);
            let _guard = self.ctx.locks.lock(&key).await;
            let base_revision = self
                .ctx
                .storage
                .entry(&key)
                .and_then(|entry| entry.server_revision);
            let op = PendingOperation::new(entity_type, entity_id, kind, payload, base_revision);
            self.ctx.storage.append_operation(op).map_err(|e| {
                error!("❌ 本地变更写入失败，未被捕获: {}", e);
                self.ctx.report_error(format!("本地保存失败: {}", e));
                e
            })?
        };

        info!(
            "📝 记录变更: {} {} base={:?} op_id={}",
            op.kind,
            op.key(),
            op.base_revision,
            op.op_id
        );
        self.ctx.events.emit(SyncEvent::OperationRecorded {
            op_id: op.op_id.clone(),
            key: op.key(),
        });
        self.ctx.refresh_status();
        self.ctx.wake.notify_one();
        Ok(op.op_id)
    }
}
