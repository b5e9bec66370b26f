//! 同步组件共享的引擎实例状态

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::events::{EventManager, StatusPublisher, SyncEvent, SyncStatus};
use crate::network::ConnectivityMonitor;
use crate::remote::RemoteStore;
use crate::storage::StorageManager;
use crate::sync::{ConflictPolicy, EntityLocks};
use crate::utils::time::now_millis;

/// 一个引擎实例内各组件共享的依赖
///
/// 没有进程级单例：每个 `SyncEngine` 各自持有一份。
#[derive(Debug)]
pub struct SyncContext {
    pub config: SyncConfig,
    pub storage: Arc<StorageManager>,
    pub locks: EntityLocks,
    pub events: EventManager,
    pub status: StatusPublisher,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub remote: Arc<dyn RemoteStore>,
    pub conflict_policy: Arc<dyn ConflictPolicy>,
    /// 新工作到达时唤醒调度器
    pub wake: Notify,
    /// 游标被重置时递增，变更流订阅任务据此从新游标重新订阅
    resync: watch::Sender<u64>,
    session_expired: AtomicBool,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        storage: Arc<StorageManager>,
        connectivity: Arc<ConnectivityMonitor>,
        remote: Arc<dyn RemoteStore>,
        conflict_policy: Arc<dyn ConflictPolicy>,
    ) -> Self {
        let events = EventManager::new(config.event_capacity);
        let context = Self {
            config,
            storage,
            locks: EntityLocks::new(),
            events,
            status: StatusPublisher::new(SyncStatus::default()),
            connectivity,
            remote,
            conflict_policy,
            wake: Notify::new(),
            resync: watch::channel(0).0,
            session_expired: AtomicBool::new(false),
        };
        context.refresh_status();
        context
    }

    /// 要求变更流订阅任务丢弃当前订阅，从已存游标重新订阅
    pub fn request_resync(&self) {
        self.resync.send_modify(|generation| *generation += 1);
        debug!("已请求重新订阅变更流");
    }

    pub fn subscribe_resync(&self) -> watch::Receiver<u64> {
        self.resync.subscribe()
    }

    pub fn is_session_expired(&self) -> bool {
        self.session_expired.load(Ordering::SeqCst)
    }

    /// 进入会话过期状态，派发暂停
    pub fn expire_session(&self, message: String) {
        if !self.session_expired.swap(true, Ordering::SeqCst) {
            warn!("🔒 会话已过期，暂停派发: {}", message);
            self.events.emit(SyncEvent::SessionExpired {
                message: message.clone(),
            });
        }
        self.status.update(|s| {
            s.session_expired = true;
            s.last_error = Some(message);
        });
    }

    pub fn resume_session(&self) {
        self.session_expired.store(false, Ordering::SeqCst);
        self.status.update(|s| s.session_expired = false);
    }

    /// 从 Outbox 与连接状态重新计算状态流
    pub fn refresh_status(&self) {
        let stats = self.storage.stats();
        let online = self.connectivity.is_effectively_online();
        let session_expired = self.is_session_expired();
        self.status.update(|s| {
            s.pending_count = stats.total - stats.failed;
            s.failed_count = stats.failed;
            s.online = online;
            s.session_expired = session_expired;
        });
    }

    /// 永久 / 致命错误发布到状态流
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.status.update(|s| s.last_error = Some(message));
    }

    pub fn mark_synced(&self) {
        let now = now_millis();
        self.status.update(|s| s.last_sync_at = Some(now));
    }
}
