//! 同步引擎主入口 - SyncEngine
//!
//! 分层结构：
//! ```text
//! SyncEngine (对 UI / 适配层的接口)
//!   ├── MutationRecorder  (本地变更 → Outbox)
//!   ├── SyncScheduler     (何时 drain)
//!   │     └── BatchDispatcher (Outbox → 远端)
//!   ├── RealtimeReconciler (远端变更流 → 本地缓存)
//!   └── SyncContext       (存储 / 实体锁 / 事件 / 状态 / 连接)
//! ```
//!
//! 引擎是显式实例，持久化层、连接监控与远端客户端都由调用方注入，
//! 多个实例之间不共享任何状态。

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::{FintrackError, Result};
use crate::events::{DrainReport, EventFilter, FilteredEventReceiver, SyncEvent, SyncStatus};
use crate::network::ConnectivityMonitor;
use crate::remote::RemoteStore;
use crate::storage::{
    DurableStore, LocalCacheEntry, OperationKind, OperationStatus, PendingOperation, SledStore,
    StorageManager,
};
use crate::sync::{
    BatchDispatcher, ConflictPolicy, EntityKey, EntityType, LastWriteWins, MutationRecorder,
    RealtimeReconciler, SchedulerHandle, SyncContext, SyncScheduler,
};
use crate::utils::time::now_millis;

/// 运行中的后台任务
#[derive(Debug)]
struct RunningTasks {
    shutdown: watch::Sender<bool>,
    scheduler: SchedulerHandle,
    reconciler: Option<JoinHandle<()>>,
}

impl RunningTasks {
    async fn join(self) {
        self.scheduler.join().await;
        if let Some(reconciler) = self.reconciler {
            if let Err(e) = reconciler.await {
                warn!("⚠️ 变更流任务异常退出: {}", e);
            }
        }
    }
}

/// 离线优先同步引擎
#[derive(Debug)]
pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    recorder: MutationRecorder,
    dispatcher: Arc<BatchDispatcher>,
    reconciler: Arc<RealtimeReconciler>,
    running: Mutex<Option<RunningTasks>>,
    /// 已 stop、尚未被 shutdown 回收的任务
    stopping: Mutex<Vec<RunningTasks>>,
    status_callbacks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// 使用默认冲突策略（LastWriteWins）创建引擎
    pub fn new(
        config: SyncConfig,
        durable: Arc<dyn DurableStore>,
        connectivity: Arc<ConnectivityMonitor>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        Self::with_conflict_policy(config, durable, connectivity, remote, Arc::new(LastWriteWins))
    }

    pub fn with_conflict_policy(
        config: SyncConfig,
        durable: Arc<dyn DurableStore>,
        connectivity: Arc<ConnectivityMonitor>,
        remote: Arc<dyn RemoteStore>,
        conflict_policy: Arc<dyn ConflictPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(StorageManager::open(durable)?);
        let ctx = Arc::new(SyncContext::new(
            config,
            storage,
            connectivity,
            remote,
            conflict_policy,
        ));
        let stats = ctx.storage.stats();
        info!(
            "✅ 同步引擎已创建: outbox={} failed={} online={}",
            stats.total,
            stats.failed,
            ctx.connectivity.is_effectively_online()
        );

        Ok(Self {
            recorder: MutationRecorder::new(ctx.clone()),
            dispatcher: Arc::new(BatchDispatcher::new(ctx.clone())),
            reconciler: Arc::new(RealtimeReconciler::new(ctx.clone())),
            ctx,
            running: Mutex::new(None),
            stopping: Mutex::new(Vec::new()),
            status_callbacks: SyncMutex::new(Vec::new()),
        })
    }

    /// 打开 `config.data_dir` 下的 sled 存储（`namespace` 通常为用户 ID）并创建引擎
    pub async fn open(
        config: SyncConfig,
        namespace: &str,
        connectivity: Arc<ConnectivityMonitor>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        config.validate()?;
        let durable = SledStore::open(&config.data_dir, namespace).await?;
        Self::new(config, Arc::new(durable), connectivity, remote)
    }

    // ========== 生命周期 ==========

    /// 启动调度器与变更流订阅；重复调用无副作用
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = SyncScheduler::new(self.ctx.clone(), self.dispatcher.clone())
            .spawn(shutdown_rx.clone());
        let reconciler = if self.ctx.config.entity_types.is_empty() {
            None
        } else {
            Some(tokio::spawn(self.reconciler.clone().run(shutdown_rx)))
        };

        *running = Some(RunningTasks {
            shutdown,
            scheduler,
            reconciler,
        });
        info!("🚀 同步引擎已启动");
        Ok(())
    }

    /// 停止：取消定时器与订阅，不再开始新的 drain
    ///
    /// 进行中的 drain 不会被中断，需要等待它结束请用 [`SyncEngine::shutdown`]。
    pub async fn stop(&self) {
        let tasks = self.running.lock().await.take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            self.stopping.lock().await.push(tasks);
            info!("⏹️ 同步引擎已停止");
        }
        for handle in self.status_callbacks.lock().drain(..) {
            handle.abort();
        }
        self.ctx.events.clear_listeners();
    }

    /// 停止并等待后台任务（包括进行中的 drain）结束，然后落盘
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭同步引擎...");
        self.stop().await;
        let stopping: Vec<RunningTasks> = self.stopping.lock().await.drain(..).collect();
        for tasks in stopping {
            tasks.join().await;
        }
        // 直接调用 flush_now 发起的 drain 也要等它结束
        drop(self.dispatcher.pause().await);
        self.ctx.storage.flush()?;
        info!("同步引擎关闭完成");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    // ========== 本地变更 ==========

    /// 记录一次本地变更，立即更新乐观视图，返回 op_id
    ///
    /// 只有本地存储失败时返回错误。
    pub async fn record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: OperationKind,
        payload: Value,
    ) -> Result<String> {
        self.recorder.record(entity_type, entity_id, kind, payload).await
    }

    pub async fn create(&self, entity_type: EntityType, entity_id: &str, payload: Value) -> Result<String> {
        self.record(entity_type, entity_id, OperationKind::Create, payload).await
    }

    pub async fn update(&self, entity_type: EntityType, entity_id: &str, payload: Value) -> Result<String> {
        self.record(entity_type, entity_id, OperationKind::Update, payload).await
    }

    pub async fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<String> {
        self.record(entity_type, entity_id, OperationKind::Delete, Value::Null).await
    }

    /// 立即派发，返回本次 drain 的汇总
    ///
    /// 引擎运行时交给调度器执行，未启动（或已停止）时直接 drain。
    pub async fn flush_now(&self) -> Result<DrainReport> {
        let client = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|tasks| tasks.scheduler.client());
        match client {
            Some(client) if !client.is_closed() => match client.flush().await {
                // 调度器恰好在停止，改为直接 drain
                Err(FintrackError::ShuttingDown(_)) => Ok(self.dispatcher.drain().await),
                other => other,
            },
            _ => Ok(self.dispatcher.drain().await),
        }
    }

    // ========== 读取 ==========

    /// 实体的乐观视图（服务端基线叠加未确认操作）
    pub fn read(&self, entity_type: EntityType, entity_id: &str) -> Option<Value> {
        self.ctx.storage.merged_view(&EntityKey::new(entity_type, entity_id))
    }

    pub fn entry(&self, entity_type: EntityType, entity_id: &str) -> Option<LocalCacheEntry> {
        self.ctx.storage.entry(&EntityKey::new(entity_type, entity_id))
    }

    pub fn entries(&self) -> Vec<LocalCacheEntry> {
        self.ctx.storage.entries()
    }

    /// Outbox 中尚未失败的操作（pending / dispatching / conflicted）
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.ctx
            .storage
            .operations()
            .into_iter()
            .filter(|op| !op.is_failed())
            .collect()
    }

    pub fn failed_operations(&self) -> Vec<PendingOperation> {
        self.ctx.storage.failed_operations()
    }

    pub fn operation(&self, op_id: &str) -> Option<PendingOperation> {
        self.ctx.storage.operation(op_id)
    }

    // ========== 失败操作处理 ==========

    /// 用户手动重试一条失败的操作
    pub async fn retry_operation(&self, op_id: &str) -> Result<()> {
        let key = self.require_operation(op_id)?.key();
        {
            let _guard = self.ctx.locks.lock(&key).await;
            let mut op = self.require_operation(op_id)?;
            if !op.is_failed() {
                return Err(FintrackError::InvalidOperation(format!(
                    "只能重试失败的操作: {} ({})",
                    op_id, op.status
                )));
            }
            op.reset_for_retry(now_millis());
            self.ctx.storage.update_operation(&op)?;
        }
        info!("🔄 手动重试操作: {} {}", key, op_id);
        self.ctx.refresh_status();
        self.ctx.wake.notify_one();
        Ok(())
    }

    /// 显式放弃一条操作，本地视图回退到服务端基线 + 其余未确认操作
    pub async fn discard_operation(&self, op_id: &str) -> Result<()> {
        let key = self.require_operation(op_id)?.key();
        {
            let _guard = self.ctx.locks.lock(&key).await;
            let op = self.require_operation(op_id)?;
            if op.status == OperationStatus::Dispatching {
                return Err(FintrackError::InvalidOperation(format!(
                    "操作正在发送中，不能丢弃: {}",
                    op_id
                )));
            }
            self.ctx.storage.discard_operation(op_id)?;
        }
        warn!("🗑️ 已丢弃操作: {} {}", key, op_id);
        self.ctx.events.emit(SyncEvent::OperationDiscarded {
            op_id: op_id.to_string(),
            key,
        });
        self.ctx.refresh_status();
        Ok(())
    }

    fn require_operation(&self, op_id: &str) -> Result<PendingOperation> {
        self.ctx
            .storage
            .operation(op_id)
            .ok_or_else(|| FintrackError::NotFound(format!("操作不存在: {}", op_id)))
    }

    /// 清空 Outbox、本地缓存与游标（破坏性，仅用于"清除本地数据"）
    pub async fn reset_all(&self) -> Result<()> {
        let _paused = self.dispatcher.pause().await;
        self.ctx.storage.reset_all()?;
        self.ctx.locks.prune();
        self.ctx.request_resync();
        self.ctx.status.update(|s| s.last_error = None);
        self.ctx.refresh_status();
        warn!("⚠️ 已清空本地同步数据");
        Ok(())
    }

    // ========== 连接与会话 ==========

    /// 强制离线开关（测试 / 用户"离线模式"）
    pub fn set_forced_offline(&self, forced_offline: bool) {
        self.ctx.connectivity.set_forced_offline(forced_offline);
        self.ctx.refresh_status();
    }

    /// 平台网络状态上报
    pub fn set_online(&self, online: bool) {
        self.ctx.connectivity.set_online(online);
        self.ctx.refresh_status();
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.ctx.connectivity
    }

    /// 重新登录后恢复派发
    pub fn resume_after_auth(&self) {
        if self.ctx.is_session_expired() {
            info!("🔓 会话已恢复，继续派发");
        }
        self.ctx.resume_session();
        self.ctx.wake.notify_one();
    }

    // ========== 状态与事件 ==========

    pub fn status(&self) -> SyncStatus {
        self.ctx.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.ctx.status.subscribe()
    }

    /// 回调风格的状态订阅，`stop()` 时注销
    pub fn on_status<F>(&self, callback: F)
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let handle = self.ctx.status.on_status(callback);
        self.status_callbacks.lock().push(handle);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.events.subscribe()
    }

    pub fn subscribe_events_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.ctx.events.subscribe_filtered(filter)
    }

    /// 添加事件监听器，`"*"` 表示所有事件
    pub fn add_event_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.ctx.events.add_listener(event_type, listener);
    }

    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }
}
