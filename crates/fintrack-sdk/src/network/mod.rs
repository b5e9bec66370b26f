use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::utils::time::now_millis;

/// 连接状态
///
/// 实际是否在线 = `online && !forced_offline`，强制离线优先于平台信号。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    /// 平台上报的在线状态
    pub online: bool,
    /// 手动 / 测试用的强制离线开关
    pub forced_offline: bool,
}

impl ConnectivityState {
    pub fn is_effectively_online(&self) -> bool {
        self.online && !self.forced_offline
    }
}

/// 连接状态变化事件
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityEvent {
    pub old_state: ConnectivityState,
    pub new_state: ConnectivityState,
    pub timestamp: i64,
}

impl ConnectivityEvent {
    /// 实际在线状态从离线变为在线
    pub fn became_online(&self) -> bool {
        !self.old_state.is_effectively_online() && self.new_state.is_effectively_online()
    }

    pub fn became_offline(&self) -> bool {
        self.old_state.is_effectively_online() && !self.new_state.is_effectively_online()
    }
}

/// 平台网络信号监听器（由平台层实现，如 Android/iOS/桌面）
#[async_trait]
pub trait ConnectivityListener: Send + Sync + std::fmt::Debug {
    /// 当前平台是否在线
    async fn current_online(&self) -> bool;

    /// 开始监听，每次平台状态变化发送一次
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<bool>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 连接监控器
///
/// 每个引擎实例持有自己的监控器，测试之间不共享状态。
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: RwLock<ConnectivityState>,
    status_sender: broadcast::Sender<ConnectivityEvent>,
    listener: Mutex<Option<(Arc<dyn ConnectivityListener>, JoinHandle<()>)>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            state: RwLock::new(ConnectivityState {
                online,
                forced_offline: false,
            }),
            status_sender,
            listener: Mutex::new(None),
        }
    }

    /// 接入平台监听器，之后平台信号自动驱动 `online`
    pub async fn attach(self: &Arc<Self>, listener: Arc<dyn ConnectivityListener>) -> Result<()> {
        self.detach().await;

        self.set_online(listener.current_online().await);
        let mut receiver = listener.start_monitoring().await?;
        let monitor = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(online) => match monitor.upgrade() {
                        Some(monitor) => monitor.set_online(online),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("平台网络监听任务结束");
        });

        *self.listener.lock() = Some((listener, handle));
        info!("✅ 平台网络监听已接入");
        Ok(())
    }

    /// 停止平台监听
    pub async fn detach(&self) {
        let previous = self.listener.lock().take();
        if let Some((listener, handle)) = previous {
            listener.stop_monitoring().await;
            handle.abort();
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.read()
    }

    pub fn is_effectively_online(&self) -> bool {
        self.state().is_effectively_online()
    }

    pub fn set_online(&self, online: bool) {
        self.update(|state| state.online = online);
    }

    /// 强制离线（测试钩子 / 手动“模拟离线”）
    pub fn set_forced_offline(&self, forced_offline: bool) {
        self.update(|state| state.forced_offline = forced_offline);
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.status_sender.subscribe()
    }

    fn update(&self, change: impl FnOnce(&mut ConnectivityState)) {
        let event = {
            let mut state = self.state.write();
            let old_state = *state;
            change(&mut *state);
            if *state == old_state {
                return;
            }
            ConnectivityEvent {
                old_state,
                new_state: *state,
                timestamp: now_millis(),
            }
        };

        if event.became_online() {
            info!("🌐 网络已恢复 (effective online)");
        } else if event.became_offline() {
            info!("📴 网络已断开 (effective offline)");
        }
        let _ = self.status_sender.send(event);
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// 测试用：手动驱动的平台网络监听器
    #[derive(Debug)]
    pub struct ManualConnectivityListener {
        online: RwLock<bool>,
        sender: broadcast::Sender<bool>,
    }

    impl ManualConnectivityListener {
        pub fn new(online: bool) -> Self {
            let (sender, _) = broadcast::channel(16);
            Self {
                online: RwLock::new(online),
                sender,
            }
        }

        pub fn set(&self, online: bool) {
            *self.online.write() = online;
            let _ = self.sender.send(online);
        }
    }

    #[async_trait]
    impl ConnectivityListener for ManualConnectivityListener {
        async fn current_online(&self) -> bool {
            *self.online.read()
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<bool>> {
            Ok(self.sender.subscribe())
        }

        async fn stop_monitoring(&self) {}
    }
}

#[cfg(test)]
pub use test_helpers::ManualConnectivityListener;
