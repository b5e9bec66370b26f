//! 同步调度器
//!
//! 状态机：idle → scheduled(timer) → draining → idle。
//! 触发 drain 的来源：启动、flushNow、新变更、网络恢复、退避到期、兜底定时器。
//! `stop()` 只阻止新的 drain，进行中的 drain 会跑完（或等到它自己的超时）。

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use crate::error::{FintrackError, Result};
use crate::events::{DrainReport, SchedulerPhase, SyncEvent};
use crate::sync::{BatchDispatcher, SyncContext};
use crate::utils::time::{now_millis, until_millis};

/// 发给调度任务的命令
#[derive(Debug)]
pub enum SchedulerCommand {
    /// 立即 drain，并回传结果
    Flush(oneshot::Sender<DrainReport>),
}

/// 向调度任务发命令的句柄，可克隆
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    commands: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerClient {
    /// 请求立即 drain 并等待结果
    pub async fn flush(&self) -> Result<DrainReport> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SchedulerCommand::Flush(reply))
            .await
            .map_err(|_| FintrackError::ShuttingDown("调度器已停止".to_string()))?;
        response
            .await
            .map_err(|_| FintrackError::ShuttingDown("调度器已停止".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// 运行中的调度任务
#[derive(Debug)]
pub struct SchedulerHandle {
    client: SchedulerClient,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn client(&self) -> SchedulerClient {
        self.client.clone()
    }

    pub async fn flush(&self) -> Result<DrainReport> {
        self.client.flush().await
    }

    /// 等待调度任务退出（包括进行中的 drain）
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("⚠️ 调度任务异常退出: {}", e);
        }
    }
}

pub struct SyncScheduler {
    ctx: Arc<SyncContext>,
    dispatcher: Arc<BatchDispatcher>,
    retry_timer: DelayQueue<()>,
    /// 已登记到 retry_timer 的最早重试时间
    armed: Option<(delay_queue::Key, i64)>,
}

impl SyncScheduler {
    pub fn new(ctx: Arc<SyncContext>, dispatcher: Arc<BatchDispatcher>) -> Self {
        Self {
            ctx,
            dispatcher,
            retry_timer: DelayQueue::new(),
            armed: None,
        }
    }

    /// 启动调度任务
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> SchedulerHandle {
        let (commands, receiver) = mpsc::channel(16);
        let task = tokio::spawn(self.run(receiver, shutdown));
        SchedulerHandle {
            client: SchedulerClient { commands },
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SchedulerCommand>, mut shutdown: watch::Receiver<bool>) {
        info!("⏱️ 同步调度器启动");
        let mut connectivity = self.ctx.connectivity.subscribe();
        let flush_interval = self.ctx.config.flush_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.drain("启动").await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.arm_retry_timer();
            self.set_phase(if self.armed.is_some() {
                SchedulerPhase::Scheduled
            } else {
                SchedulerPhase::Idle
            });

            let trigger = tokio::select! {
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    Some(SchedulerCommand::Flush(reply)) => {
                        let report = self.drain("flushNow").await;
                        let _ = reply.send(report);
                        continue;
                    }
                    None => break,
                },
                _ = self.ctx.wake.notified() => "新变更",
                event = connectivity.recv() => match event {
                    Ok(event) => {
                        let online = event.new_state.is_effectively_online();
                        if event.became_online() || event.became_offline() {
                            self.ctx.events.emit(SyncEvent::ConnectivityChanged { online });
                        }
                        self.ctx.refresh_status();
                        if event.became_online() {
                            "网络恢复"
                        } else {
                            continue;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.ctx.refresh_status();
                        "网络状态"
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = interval.tick() => "定时",
                Some(_) = self.retry_timer.next() => {
                    self.armed = None;
                    "退避到期"
                }
            };

            self.drain(trigger).await;
        }

        self.set_phase(SchedulerPhase::Stopped);
        info!("⏹️ 同步调度器停止");
    }

    async fn drain(&mut self, trigger: &str) -> DrainReport {
        debug!("触发 drain: {}", trigger);
        self.set_phase(SchedulerPhase::Draining);
        let report = self.dispatcher.drain().await;
        self.set_phase(SchedulerPhase::Idle);
        report
    }

    /// 把最早的未来重试时间登记到定时器
    ///
    /// 离线或会话过期时不登记，恢复后由网络事件 / resume 触发。
    fn arm_retry_timer(&mut self) {
        let earliest = if self.ctx.connectivity.is_effectively_online() && !self.ctx.is_session_expired() {
            self.ctx
                .storage
                .earliest_retry_at()
                .filter(|at| *at > now_millis())
        } else {
            None
        };

        if let Some((_, armed_at)) = &self.armed {
            if Some(*armed_at) == earliest {
                return;
            }
        }
        if let Some((key, _)) = self.armed.take() {
            self.retry_timer.remove(&key);
        }
        if let Some(at) = earliest {
            let key = self.retry_timer.insert((), until_millis(at));
            self.armed = Some((key, at));
        }
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        self.ctx.status.update(|s| s.phase = phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteFault;
    use crate::storage::OperationKind;
    use crate::sync::{test_support, EntityType, MutationRecorder};
    use serde_json::json;
    use std::time::Duration;

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn start(ctx: &Arc<SyncContext>) -> (SchedulerHandle, watch::Sender<bool>) {
        let dispatcher = Arc::new(BatchDispatcher::new(ctx.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (SyncScheduler::new(ctx.clone(), dispatcher).spawn(shutdown_rx), shutdown_tx)
    }

    #[tokio::test]
    async fn test_record_wakes_scheduler() {
        let (ctx, remote) = test_support::context();
        let (handle, shutdown) = start(&ctx);

        MutationRecorder::new(ctx.clone())
            .record(EntityType::Category, "cat-1", OperationKind::Create, json!({"name": "food"}))
            .await
            .unwrap();
        assert!(wait_until(|| ctx.storage.pending_count() == 0).await);
        assert_eq!(remote.apply_calls(), 1);

        shutdown.send(true).unwrap();
        handle.join().await;
        assert_eq!(ctx.status.current().phase, SchedulerPhase::Stopped);
    }

    #[tokio::test]
    async fn test_reconnect_triggers_drain() {
        let (ctx, remote) = test_support::context();
        ctx.connectivity.set_forced_offline(true);
        let (handle, shutdown) = start(&ctx);

        MutationRecorder::new(ctx.clone())
            .record(EntityType::Transaction, "tx-1", OperationKind::Create, json!({"amount": 12}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.apply_calls(), 0);

        ctx.connectivity.set_forced_offline(false);
        assert!(wait_until(|| ctx.storage.pending_count() == 0).await);
        assert_eq!(remote.apply_calls(), 1);

        shutdown.send(true).unwrap();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_retry_timer_fires_after_backoff() {
        let (ctx, remote) = test_support::context();
        remote.inject_fault(RemoteFault::Network);
        let (handle, shutdown) = start(&ctx);

        MutationRecorder::new(ctx.clone())
            .record(EntityType::Budget, "budget-7", OperationKind::Create, json!({"amount": 1}))
            .await
            .unwrap();
        assert!(wait_until(|| ctx.storage.pending_count() == 0).await);
        assert_eq!(remote.apply_calls(), 2);

        shutdown.send(true).unwrap();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_flush_command_returns_report() {
        let (ctx, _) = test_support::context();
        ctx.connectivity.set_forced_offline(true);
        MutationRecorder::new(ctx.clone())
            .record(EntityType::Budget, "budget-7", OperationKind::Create, json!({"amount": 1}))
            .await
            .unwrap();
        let (handle, shutdown) = start(&ctx);

        ctx.connectivity.set_forced_offline(false);
        // 网络恢复也会触发 drain，flush 可能拿到空报告；合计应用一次
        let report = handle.flush().await.unwrap();
        assert!(report.applied <= 1);
        assert!(wait_until(|| ctx.storage.pending_count() == 0).await);

        shutdown.send(true).unwrap();
        handle.join().await;
    }
}
