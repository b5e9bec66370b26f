//! 离线优先同步模块
//!
//! 职责：
//! - 记录本地变更（MutationRecorder）
//! - 按实体顺序批量派发 Outbox（BatchDispatcher）
//! - 应用服务端变更流（RealtimeReconciler）
//! - 决定何时派发（SyncScheduler）

pub mod conflict;
pub mod context;
pub mod cursor_store;
pub mod dispatcher;
pub mod entity_lock;
pub mod entity_type;
pub mod reconciler;
pub mod recorder;
pub mod scheduler;

pub use conflict::{ConflictContext, ConflictPolicy, LastWriteWins, RemoteWins};
pub use context::SyncContext;
pub use cursor_store::SyncCursors;
pub use dispatcher::BatchDispatcher;
pub use entity_lock::{EntityGuard, EntityLocks};
pub use entity_type::{EntityKey, EntityType, ALL_ENTITY_TYPES};
pub use reconciler::RealtimeReconciler;
pub use recorder::MutationRecorder;
pub use scheduler::{SchedulerClient, SchedulerCommand, SchedulerHandle, SyncScheduler};
