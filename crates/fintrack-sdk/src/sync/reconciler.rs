//! 实时变更合并
//!
//! 消费服务端变更流，把权威状态写入本地缓存：
//! - revision 不新于本地的事件（重复 / 乱序）直接丢弃
//! - 实体没有待确认操作时覆盖服务端基线
//! - 有待确认操作时只更新基线，乐观操作继续叠加在视图之上
//!
//! 每处理一个事件都推进该类型的游标，断线后从游标之后继续订阅。

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{FintrackError, Result};
use crate::events::SyncEvent;
use crate::remote::RemoteChange;
use crate::storage::{ServerState, ServerStateOutcome};
use crate::sync::SyncContext;

#[derive(Debug)]
pub struct RealtimeReconciler {
    ctx: Arc<SyncContext>,
}

impl RealtimeReconciler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// 处理一个变更事件
    #[instrument(skip(self, change), fields(key = %change.key(), revision = change.revision))]
    pub async fn on_event(&self, change: RemoteChange) -> Result<ServerStateOutcome> {
        let key = change.key();
        let _guard = self.ctx.locks.lock(&key).await;

        let server = ServerState {
            revision: change.revision,
            data: change.data,
            timestamp: Some(change.server_timestamp),
            origin_op_id: change.origin_op_id,
        };
        let outcome = self
            .ctx
            .storage
            .apply_server_state(&key, server, Some(change.sequence))?;

        match outcome {
            ServerStateOutcome::Stale => {
                debug!("丢弃过期事件: {} rev={}", key, change.revision);
            }
            _ => {
                debug!("应用服务端变更: {} rev={} ({:?})", key, change.revision, outcome);
                self.ctx.events.emit(SyncEvent::RemoteChangeApplied {
                    key,
                    revision: change.revision,
                    outcome,
                });
            }
        }
        Ok(outcome)
    }

    /// 订阅循环：从已存游标订阅，流出错或结束后等待一段时间（且在线）再重新订阅
    ///
    /// 游标被重置（`reset_all`）时立即丢弃当前订阅，从新游标重新订阅。
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let types = self.ctx.config.entity_types.clone();
        if types.is_empty() {
            return;
        }
        let mut connectivity = self.ctx.connectivity.subscribe();
        let mut resync = self.ctx.subscribe_resync();
        let request_timeout = self.ctx.config.request_timeout();
        info!("🔔 变更流订阅任务启动: {:?}", types);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.ctx.connectivity.is_effectively_online() {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = connectivity.recv() => continue,
                }
            }

            let generation = *resync.borrow_and_update();
            let cursors = self.ctx.storage.cursors();
            let subscribed = tokio::select! {
                _ = shutdown.changed() => break,
                result = timeout(request_timeout, self.ctx.remote.subscribe_changes(&types, &cursors)) => match result {
                    Ok(result) => result,
                    Err(_) => Err(FintrackError::Timeout(format!(
                        "subscribeChanges 超过 {}ms 未返回",
                        request_timeout.as_millis()
                    ))),
                },
            };

            let mut resubscribe_now = false;
            match subscribed {
                Ok(mut stream) => {
                    debug!("已订阅变更流: {:?}", cursors);
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => {
                                info!("变更流订阅任务停止");
                                return;
                            }
                            _ = resync.changed() => {
                                info!("🔄 游标已重置，重新订阅变更流");
                                resubscribe_now = true;
                                break;
                            }
                            item = stream.next() => match item {
                                Some(Ok(change)) => {
                                    if *resync.borrow() != generation {
                                        resubscribe_now = true;
                                        break;
                                    }
                                    let applied = self.on_event(change).await;
                                    self.ctx.locks.prune();
                                    if let Err(e) = applied {
                                        // 游标未推进，重新订阅后会再次收到该事件
                                        warn!("⚠️ 应用服务端变更失败: {}", e);
                                        self.ctx.report_error(e.to_string());
                                        break;
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!("⚠️ 变更流中断: {}", e);
                                    if e.is_auth() {
                                        self.ctx.expire_session(e.to_string());
                                    }
                                    break;
                                }
                                None => {
                                    debug!("变更流结束");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("⚠️ 订阅变更流失败: {}", e);
                    if e.is_auth() {
                        self.ctx.expire_session(e.to_string());
                    }
                }
            }

            if resubscribe_now {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = resync.changed() => {}
                _ = tokio::time::sleep(self.ctx.config.resubscribe_delay()) => {}
            }
        }
        info!("变更流订阅任务停止");
    }
}
