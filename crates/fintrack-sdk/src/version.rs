//! SDK 版本元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Store Layout Version** → 本模块，持久化键布局变化时递增

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 本地存储键布局版本（outbox / cache / sync_cursor 前缀）
pub const STORE_LAYOUT_VERSION: u32 = 1;
