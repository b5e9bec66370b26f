//! Fintrack SDK - 离线优先的个人记账同步引擎
//!
//! 本 SDK 负责在无网络时也能编辑数据，并在恢复连接后与服务端权威存储对账：
//! - 📝 本地变更记录：写入 Outbox 的同时立即更新乐观视图
//! - 📤 批量派发：同一实体严格按记录顺序、同一时刻最多一条在途
//! - 🔄 重试退避：指数退避 + 抖动，超过上限进入 failed 并上报
//! - ⚔️ 冲突处理：可插拔的冲突策略，默认 last-write-wins
//! - 🔔 实时对账：消费服务端变更流，按游标断点续传
//! - 📡 连接监控：平台网络状态 + 强制离线开关
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fintrack_sdk::{ConnectivityMonitor, EntityType, HttpRemoteStore, SyncConfig, SyncEngine};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .build();
//!     let remote = Arc::new(HttpRemoteStore::new(
//!         "https://api.example.com",
//!         config.http_client_config.clone(),
//!     )?);
//!     let connectivity = Arc::new(ConnectivityMonitor::new(true));
//!
//!     let engine = SyncEngine::open(config, "user123", connectivity, remote).await?;
//!     engine.start().await?;
//!
//!     engine.on_status(|status| {
//!         println!("待同步: {} 最近错误: {:?}", status.pending_count, status.last_error);
//!     });
//!
//!     engine
//!         .create(EntityType::Transaction, "tx-1", json!({"amount": 12, "currency": "EUR"}))
//!         .await?;
//!     engine.flush_now().await?;
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod network;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use config::{HttpClientConfig, SyncConfig, SyncConfigBuilder};
pub use engine::SyncEngine;
pub use error::{FailureReason, FintrackError, Result};
pub use events::{
    ConflictWinner, DrainReport, EventFilter, EventManager, SchedulerPhase, SyncEvent, SyncStatus,
};
pub use network::{ConnectivityEvent, ConnectivityListener, ConnectivityMonitor, ConnectivityState};
pub use remote::{
    ApplyOutcome, ApplyResult, HttpRemoteStore, MemoryRemoteStore, RemoteChange, RemoteFault,
    RemoteOperation, RemoteStore,
};
pub use storage::queue::{BackoffController, RetryPolicy};
pub use storage::{
    DurableStore, LocalCacheEntry, MemoryStore, OperationKind, OperationStatus, PendingOperation,
    SledStore,
};
pub use sync::{ConflictPolicy, EntityKey, EntityType, LastWriteWins, RemoteWins, ALL_ENTITY_TYPES};
pub use version::SDK_VERSION;
