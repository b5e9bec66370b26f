//! 批量派发器
//!
//! 每轮从 Outbox 为每个实体选出最早的一条就绪操作，标记为发送中后整批提交给远端，
//! 再逐条应用结果。远端调用带超时，等待期间不持有任何实体锁。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FailureReason, FintrackError, Result};
use crate::events::{ConflictWinner, DrainReport, SyncEvent};
use crate::remote::{ApplyOutcome, ApplyResult};
use crate::storage::queue::BackoffController;
use crate::storage::{OperationStatus, PendingOperation, ServerState};
use crate::sync::{ConflictContext, EntityKey, SyncContext};
use crate::utils::time::{millis_after, now_millis};

#[derive(Debug)]
pub struct BatchDispatcher {
    ctx: Arc<SyncContext>,
    backoff: BackoffController,
    /// 同一时刻只有一个 drain
    drain_lock: Mutex<()>,
}

impl BatchDispatcher {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let backoff = BackoffController::new(ctx.config.retry.clone());
        Self {
            ctx,
            backoff,
            drain_lock: Mutex::new(()),
        }
    }

    pub fn backoff(&self) -> &BackoffController {
        &self.backoff
    }

    /// 等待进行中的 drain 结束，并在返回的守卫存活期间阻止新的 drain
    pub async fn pause(&self) -> MutexGuard<'_, ()> {
        self.drain_lock.lock().await
    }

    /// 在线且未过期时持续派发，直到没有就绪操作
    ///
    /// 瞬时错误在内部处理，不会从这里冒出。
    #[instrument(skip(self))]
    pub async fn drain(&self) -> DrainReport {
        let _drain = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            if !self.ctx.connectivity.is_effectively_online() {
                debug!("离线，暂停派发");
                break;
            }
            if self.ctx.is_session_expired() {
                debug!("会话已过期，暂停派发");
                break;
            }

            let batch = match self.claim_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    error!("❌ 标记发送中失败: {}", e);
                    self.ctx.report_error(e.to_string());
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            report.batches += 1;
            info!("📤 派发批次: {} 条操作", batch.len());
            let request = batch.iter().map(PendingOperation::to_remote).collect();
            let request_timeout = self.ctx.config.request_timeout();
            let response = match timeout(request_timeout, self.ctx.remote.apply_batch(request)).await {
                Ok(result) => result,
                Err(_) => Err(FintrackError::Timeout(format!(
                    "applyBatch 超过 {}ms 未返回",
                    request_timeout.as_millis()
                ))),
            };

            match response {
                Ok(results) => {
                    self.ctx.mark_synced();
                    self.apply_results(batch, results, &mut report).await;
                }
                Err(e) if e.is_auth() => {
                    self.halt_for_auth(batch, &e, &mut report).await;
                    break;
                }
                Err(e) if e.is_permanent() => {
                    error!("❌ 批次被拒绝: {}", e);
                    let reason = FailureReason::from(&e);
                    for op in batch {
                        let _guard = self.ctx.locks.lock(&op.key()).await;
                        self.fail(op, reason.clone(), None, &mut report);
                    }
                }
                Err(e) => {
                    // 请求可能已被服务端应用，结果不明时按瞬时错误退避重投
                    warn!("⚠️ 批次发送失败（可重试）: {}", e);
                    for op in batch {
                        let _guard = self.ctx.locks.lock(&op.key()).await;
                        self.retry_later(op, &e, &mut report);
                    }
                }
            }
        }

        self.ctx.locks.prune();
        self.ctx.refresh_status();
        if !report.is_empty() {
            info!(
                "✅ drain 完成: applied={} retried={} failed={} conflicted={} discarded={}",
                report.applied, report.retried, report.failed, report.conflicted, report.discarded
            );
            self.ctx.events.emit(SyncEvent::DrainCompleted {
                report: report.clone(),
            });
        }
        report
    }

    /// 选出就绪操作并在实体锁下标记为发送中
    async fn claim_batch(&self) -> Result<Vec<PendingOperation>> {
        let now = now_millis();
        let candidates = self.ctx.storage.select_ready(now, self.ctx.config.batch_size);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<EntityKey> = candidates.iter().map(PendingOperation::key).collect();
        let _guards = self.ctx.locks.lock_many(keys.iter()).await;

        // 选取与加锁之间可能被用户丢弃 / 重试，重新确认仍是就绪的队头
        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let head = self.ctx.storage.operations_for(&candidate.key()).into_iter().next();
            match head {
                Some(mut op) if op.op_id == candidate.op_id && op.is_ready(now) => {
                    op.mark_dispatching();
                    claimed.push(op);
                }
                _ => debug!("操作 {} 已不是就绪队头，跳过", candidate.op_id),
            }
        }
        self.ctx.storage.update_operations(&claimed)?;
        Ok(claimed)
    }

    async fn apply_results(
        &self,
        batch: Vec<PendingOperation>,
        results: Vec<ApplyResult>,
        report: &mut DrainReport,
    ) {
        let mut outcomes: HashMap<String, ApplyOutcome> = results
            .into_iter()
            .map(|result| (result.op_id, result.outcome))
            .collect();

        for op in batch {
            let _guard = self.ctx.locks.lock(&op.key()).await;
            match outcomes.remove(&op.op_id) {
                Some(ApplyOutcome::Applied { revision, data }) => self.complete(op, revision, data, report),
                Some(ApplyOutcome::Conflict {
                    current_revision,
                    current_data,
                    server_timestamp,
                    origin_op_id,
                }) => {
                    let remote = ConflictContext {
                        current_revision,
                        current_data,
                        server_timestamp,
                        origin_op_id,
                    };
                    self.resolve_conflict(op, remote, report);
                }
                Some(ApplyOutcome::Rejected { reason }) => {
                    warn!("⚠️ 操作 {} 被服务端拒绝: {}", op.op_id, reason);
                    self.fail(op, FailureReason::Rejected(reason), None, report);
                }
                None => {
                    let missing = FintrackError::Network(format!("响应中缺少 {} 的结果", op.op_id));
                    self.retry_later(op, &missing, report);
                }
            }
        }
    }

    fn complete(&self, op: PendingOperation, revision: u64, data: Option<serde_json::Value>, report: &mut DrainReport) {
        match self.ctx.storage.complete_operation(&op.op_id, revision, data) {
            Ok(_) => {
                debug!("✅ 操作已应用: {} {} rev={}", op.op_id, op.key(), revision);
                report.applied += 1;
                self.ctx.events.emit(SyncEvent::OperationApplied {
                    op_id: op.op_id.clone(),
                    key: op.key(),
                    revision,
                });
            }
            Err(e) => self.settle_after_storage_error(op, e),
        }
    }

    fn resolve_conflict(&self, mut op: PendingOperation, remote: ConflictContext, report: &mut DrainReport) {
        report.conflicted += 1;
        op.mark_conflicted();
        if let Err(e) = self.ctx.storage.update_operation(&op) {
            return self.settle_after_storage_error(op, e);
        }

        let key = op.key();
        let winner = self.ctx.conflict_policy.resolve(&op, &remote);
        info!(
            "⚔️ 冲突: {} base={:?} current={} → {:?} 胜出",
            key, op.base_revision, remote.current_revision, winner
        );
        let server = ServerState {
            revision: remote.current_revision,
            data: remote.current_data.clone(),
            timestamp: remote.server_timestamp,
            origin_op_id: remote.origin_op_id.clone(),
        };

        match winner {
            ConflictWinner::Remote => {
                let discarded = self
                    .ctx
                    .storage
                    .discard_operation(&op.op_id)
                    .and_then(|_| self.ctx.storage.apply_server_state(&key, server, None));
                if let Err(e) = discarded {
                    return self.settle_after_storage_error(op, e);
                }
                report.discarded += 1;
            }
            ConflictWinner::Local => {
                op.attempts += 1;
                if op.attempts >= self.backoff.policy().max_attempts {
                    return self.fail(op, FailureReason::ConflictLoop, None, report);
                }
                op.base_revision = Some(remote.current_revision);
                op.status = OperationStatus::Pending;
                op.next_retry_at = now_millis();
                let resubmitted = self
                    .ctx
                    .storage
                    .update_operation(&op)
                    .and_then(|_| self.ctx.storage.apply_server_state(&key, server, None));
                if let Err(e) = resubmitted {
                    return self.settle_after_storage_error(op, e);
                }
                report.resubmitted += 1;
            }
        }

        self.ctx.events.emit(SyncEvent::ConflictResolved {
            op_id: op.op_id.clone(),
            key,
            winner,
            current_revision: remote.current_revision,
        });
    }

    /// 瞬时失败：尝试次数 +1，按退避安排下次发送；达到上限则进入 failed
    fn retry_later(&self, mut op: PendingOperation, error: &FintrackError, report: &mut DrainReport) {
        op.attempts += 1;
        let max_attempts = self.backoff.policy().max_attempts;
        if op.attempts >= max_attempts {
            let message = format!("{} 次尝试后放弃: {}", op.attempts, error);
            return self.fail(op, FailureReason::MaxAttemptsExceeded, Some(message), report);
        }

        let delay = self.backoff.next_delay(op.attempts);
        let now = now_millis();
        op.schedule_retry(millis_after(now, delay), FailureReason::from(error));
        if let Err(e) = self.ctx.storage.update_operation(&op) {
            return self.settle_after_storage_error(op, e);
        }

        debug!(
            "🔄 操作 {} 第 {} 次失败，{}ms 后重试",
            op.op_id,
            op.attempts,
            delay.as_millis()
        );
        report.retried += 1;
        self.ctx.events.emit(SyncEvent::OperationRetryScheduled {
            op_id: op.op_id.clone(),
            key: op.key(),
            attempts: op.attempts,
            next_retry_at: op.next_retry_at,
        });
    }

    /// 永久失败：保留在 Outbox 中，等待用户重试或丢弃
    fn fail(
        &self,
        mut op: PendingOperation,
        reason: FailureReason,
        message: Option<String>,
        report: &mut DrainReport,
    ) {
        op.mark_failed(reason.clone());
        if let Some(message) = message {
            op.last_error = Some(message);
        }
        let last_error = op.last_error.clone().unwrap_or_else(|| reason.to_string());
        if let Err(e) = self.ctx.storage.update_operation(&op) {
            return self.settle_after_storage_error(op, e);
        }

        error!("❌ 操作 {} ({}) 失败: {}", op.op_id, op.key(), last_error);
        report.failed += 1;
        self.ctx.report_error(format!("{}: {}", op.key(), last_error));
        self.ctx.events.emit(SyncEvent::OperationFailed {
            op_id: op.op_id.clone(),
            key: op.key(),
            reason,
        });
    }

    /// 会话过期：整批回到 pending，不消耗尝试次数
    async fn halt_for_auth(&self, batch: Vec<PendingOperation>, error: &FintrackError, report: &mut DrainReport) {
        let keys: Vec<EntityKey> = batch.iter().map(PendingOperation::key).collect();
        let _guards = self.ctx.locks.lock_many(keys.iter()).await;

        let reverted: Vec<PendingOperation> = batch
            .into_iter()
            .map(|mut op| {
                op.status = OperationStatus::Pending;
                op
            })
            .collect();
        if let Err(e) = self.ctx.storage.update_operations(&reverted) {
            error!("❌ 回退发送中操作失败: {}", e);
            self.ctx.report_error(e.to_string());
        }

        report.auth_halted = true;
        self.ctx.expire_session(error.to_string());
    }

    /// 结果已收到但本地写入失败：尽量把操作放回 pending，重启后也会恢复
    fn settle_after_storage_error(&self, mut op: PendingOperation, error: FintrackError) {
        error!("❌ 应用 {} 的结果时本地写入失败: {}", op.op_id, error);
        self.ctx.report_error(error.to_string());
        op.status = OperationStatus::Pending;
        if let Err(e) = self.ctx.storage.update_operation(&op) {
            warn!("⚠️ 操作 {} 暂留在发送中状态，重启后恢复: {}", op.op_id, e);
        }
    }
}
