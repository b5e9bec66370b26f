use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FintrackError {
    /// 网络错误（可重试）
    #[error("Network error: {0}")]
    Network(String),
    /// 远端调用超时（按网络错误处理）
    #[error("Timeout: {0}")]
    Timeout(String),
    /// 会话失效，需要重新登录
    #[error("Authentication error: {0}")]
    Auth(String),
    /// 服务端拒绝（不可重试）
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict on {entity_id}: base revision {base_revision:?}, current {current_revision}")]
    Conflict {
        entity_id: String,
        base_revision: Option<u64>,
        current_revision: u64,
    },
    /// 本地持久化失败（对 record 调用方是致命错误）
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<sled::Error> for FintrackError {
    fn from(error: sled::Error) -> Self {
        FintrackError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for FintrackError {
    fn from(error: serde_json::Error) -> Self {
        FintrackError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FintrackError {
    fn from(error: std::io::Error) -> Self {
        FintrackError::Storage(error.to_string())
    }
}

impl From<reqwest::Error> for FintrackError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FintrackError::Timeout(error.to_string())
        } else {
            FintrackError::Network(error.to_string())
        }
    }
}

impl FintrackError {
    /// 瞬时错误：退避后重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, FintrackError::Network(_) | FintrackError::Timeout(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, FintrackError::Auth(_))
    }

    /// 永久错误：不重试，按操作上报
    pub fn is_permanent(&self) -> bool {
        matches!(self, FintrackError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, FintrackError>;

/// 操作失败原因（随 PendingOperation 持久化，供 UI 展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// 网络超时 → 重试
    Timeout,
    /// 网络不可用 → 等待恢复
    Network(String),
    /// 服务端拒绝 → 不重试
    Rejected(String),
    /// 冲突重提次数耗尽
    ConflictLoop,
    /// 重试次数耗尽
    MaxAttemptsExceeded,
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::Network(_))
    }
}

impl From<&FintrackError> for FailureReason {
    fn from(error: &FintrackError) -> Self {
        match error {
            FintrackError::Timeout(_) => FailureReason::Timeout,
            FintrackError::Network(msg) => FailureReason::Network(msg.clone()),
            FintrackError::Validation(msg) => FailureReason::Rejected(msg.clone()),
            other => FailureReason::Network(other.to_string()),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "远端调用超时"),
            FailureReason::Network(msg) => write!(f, "网络错误: {}", msg),
            FailureReason::Rejected(msg) => write!(f, "服务端拒绝: {}", msg),
            FailureReason::ConflictLoop => write!(f, "冲突重提次数耗尽"),
            FailureReason::MaxAttemptsExceeded => write!(f, "重试次数耗尽"),
        }
    }
}
