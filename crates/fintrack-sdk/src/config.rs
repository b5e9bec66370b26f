//! 同步引擎配置

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FintrackError, Result};
use crate::storage::queue::RetryPolicy;
use crate::sync::{EntityType, ALL_ENTITY_TYPES};

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 长轮询单次等待（秒），服务端无变更时最多挂起这么久
    pub long_poll_secs: u64,
    /// 鉴权 token，作为 Bearer 发送
    pub bearer_token: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            long_poll_secs: 25,
            bearer_token: None,
        }
    }
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录（sled）
    pub data_dir: PathBuf,
    /// 重试配置
    pub retry: RetryPolicy,
    /// 单次远端调用超时（毫秒）
    pub request_timeout_ms: u64,
    /// 每批最多发送的操作数
    pub batch_size: usize,
    /// 兜底定时 flush 间隔（毫秒）
    pub flush_interval_ms: u64,
    /// 订阅变更流的实体类型
    pub entity_types: Vec<EntityType>,
    /// 事件广播容量
    pub event_capacity: usize,
    /// 变更流断开后重新订阅前的等待（毫秒）
    pub resubscribe_delay_ms: u64,
    pub http_client_config: HttpClientConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./fintrack_data"),
            retry: RetryPolicy::default(),
            request_timeout_ms: 15_000,
            batch_size: 50,
            flush_interval_ms: 30_000,
            entity_types: ALL_ENTITY_TYPES.to_vec(),
            event_capacity: 256,
            resubscribe_delay_ms: 1_000,
            http_client_config: HttpClientConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.request_timeout_ms == 0 {
            return Err(FintrackError::Config("request_timeout_ms 必须大于 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(FintrackError::Config("batch_size 必须大于 0".to_string()));
        }
        if self.flush_interval_ms == 0 {
            return Err(FintrackError::Config("flush_interval_ms 必须大于 0".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(FintrackError::Config("event_capacity 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    /// 设置退避区间（毫秒）
    pub fn backoff(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.config.retry.base_delay_ms = base_delay_ms;
        self.config.retry.max_delay_ms = max_delay_ms;
        self
    }

    pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.config.retry.jitter_factor = jitter_factor;
        self
    }

    pub fn request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.request_timeout_ms = timeout_ms;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.flush_interval_ms = interval_ms;
        self
    }

    pub fn entity_types<I: IntoIterator<Item = EntityType>>(mut self, types: I) -> Self {
        self.config.entity_types = types.into_iter().collect();
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn resubscribe_delay_ms(mut self, delay_ms: u64) -> Self {
        self.config.resubscribe_delay_ms = delay_ms;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.entity_types.len(), ALL_ENTITY_TYPES.len());
    }

    #[test]
    fn test_builder_overrides() {
        let config = SyncConfig::builder()
            .data_dir("/tmp/fintrack")
            .backoff(5, 40)
            .max_attempts(3)
            .batch_size(10)
            .entity_types([EntityType::Budget])
            .build();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/fintrack"));
        assert_eq!(config.retry.base_delay_ms, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.entity_types, vec![EntityType::Budget]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(SyncConfig::builder().batch_size(0).build().validate().is_err());
        assert!(SyncConfig::builder().request_timeout_ms(0).build().validate().is_err());
        assert!(SyncConfig::builder().jitter_factor(1.5).build().validate().is_err());
        assert!(SyncConfig::builder().max_attempts(0).build().validate().is_err());
    }
}
