//! 事件系统模块 - 同步引擎对外通知
//!
//! 功能包括：
//! - 操作生命周期事件（记录、应用、重试、失败、丢弃）
//! - 冲突裁决通知
//! - 变更流应用、连接变化、会话过期
//! - `SyncStatus` 状态流（watch 通道，只保留最新值）

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::FailureReason;
use crate::storage::ServerStateOutcome;
use crate::sync::{EntityKey, EntityType};
use crate::utils::time::now_millis;

/// 冲突裁决的胜方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// 一次 drain 的结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// 服务端确认成功
    pub applied: usize,
    /// 瞬时失败，已安排退避重试
    pub retried: usize,
    /// 进入 failed（等待用户处理）
    pub failed: usize,
    /// 收到冲突的操作数
    pub conflicted: usize,
    /// 冲突裁决后远端胜出而丢弃的本地操作
    pub discarded: usize,
    /// 冲突裁决后本地胜出、以新 base_revision 重新提交
    pub resubmitted: usize,
    /// 因会话过期而中止
    pub auth_halted: bool,
    /// 发送的批次数
    pub batches: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.batches == 0
    }
}

/// 同步引擎事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 本地变更已写入 Outbox
    OperationRecorded {
        op_id: String,
        key: EntityKey,
    },
    /// 服务端确认
    OperationApplied {
        op_id: String,
        key: EntityKey,
        revision: u64,
    },
    /// 瞬时失败，等待退避
    OperationRetryScheduled {
        op_id: String,
        key: EntityKey,
        attempts: u32,
        next_retry_at: i64,
    },
    /// 进入 failed，需要用户重试或丢弃
    OperationFailed {
        op_id: String,
        key: EntityKey,
        reason: FailureReason,
    },
    ConflictResolved {
        op_id: String,
        key: EntityKey,
        winner: ConflictWinner,
        current_revision: u64,
    },
    /// 操作被明确放弃
    OperationDiscarded {
        op_id: String,
        key: EntityKey,
    },
    RemoteChangeApplied {
        key: EntityKey,
        revision: u64,
        outcome: ServerStateOutcome,
    },
    ConnectivityChanged {
        online: bool,
    },
    /// 会话过期，派发已暂停
    SessionExpired {
        message: String,
    },
    DrainCompleted {
        report: DrainReport,
    },
}

impl SyncEvent {
    /// 事件类型名（监听器按此注册）
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::OperationRecorded { .. } => "operation_recorded",
            SyncEvent::OperationApplied { .. } => "operation_applied",
            SyncEvent::OperationRetryScheduled { .. } => "operation_retry_scheduled",
            SyncEvent::OperationFailed { .. } => "operation_failed",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::OperationDiscarded { .. } => "operation_discarded",
            SyncEvent::RemoteChangeApplied { .. } => "remote_change_applied",
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::SessionExpired { .. } => "session_expired",
            SyncEvent::DrainCompleted { .. } => "drain_completed",
        }
    }

    /// 相关实体（如果有）
    pub fn key(&self) -> Option<&EntityKey> {
        match self {
            SyncEvent::OperationRecorded { key, .. }
            | SyncEvent::OperationApplied { key, .. }
            | SyncEvent::OperationRetryScheduled { key, .. }
            | SyncEvent::OperationFailed { key, .. }
            | SyncEvent::ConflictResolved { key, .. }
            | SyncEvent::OperationDiscarded { key, .. }
            | SyncEvent::RemoteChangeApplied { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 事件类型过滤
    pub event_types: Option<Vec<String>>,
    /// 实体类型过滤（无实体的事件不受影响）
    pub entity_types: Option<Vec<EntityType>>,
}

impl EventFilter {
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let (Some(ref entity_types), Some(key)) = (&self.entity_types, event.key()) {
            if !entity_types.contains(&key.entity_type) {
                return false;
            }
        }
        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("stats", &*self.stats.read())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(now_millis());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read();
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`"*"` 表示所有事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));
        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();
        info!("Added listener for event type: {}", event_type);
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 调度器状态机：idle → scheduled(timer) → draining → idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    #[default]
    Stopped,
    Idle,
    /// 有退避中的操作，等待定时器
    Scheduled,
    Draining,
}

/// 面向 UI 的同步状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Outbox 中尚未终结且未失败的操作数（failed 单独计入 failed_count）
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_error: Option<String>,
    /// 最近一次有批次成功往返的时间（UTC 毫秒）
    pub last_sync_at: Option<i64>,
    pub online: bool,
    pub session_expired: bool,
    pub phase: SchedulerPhase,
}

/// 状态发布器：只在值真正变化时通知订阅者
#[derive(Debug)]
pub struct StatusPublisher {
    sender: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
    pub fn new(initial: SyncStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn update(&self, change: impl FnOnce(&mut SyncStatus)) {
        self.sender.send_if_modified(|status| {
            let before = status.clone();
            change(status);
            *status != before
        });
    }

    pub fn current(&self) -> SyncStatus {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.sender.subscribe()
    }

    /// 回调风格订阅：先回调一次当前值，之后每次变化回调
    pub fn on_status<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let mut receiver = self.sender.subscribe();
        tokio::spawn(async move {
            callback(&receiver.borrow_and_update().clone());
            while receiver.changed().await.is_ok() {
                let status = receiver.borrow_and_update().clone();
                callback(&status);
            }
        })
    }
}
