//! HTTP 远端存储 - 基于 reqwest
//!
//! - `POST {base}/sync/batch`：请求体 `{"operations": [...]}`，响应 `{"results": [...]}`
//! - `GET {base}/sync/changes?types=..&after=..&wait=..`：长轮询，响应 `{"changes": [...]}`

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::HttpClientConfig;
use crate::error::{FintrackError, Result};
use crate::remote::{ApplyResult, ChangeStream, RemoteChange, RemoteOperation, RemoteStore};
use crate::sync::{EntityType, SyncCursors};

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    operations: &'a [RemoteOperation],
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    results: Vec<ApplyResult>,
}

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    changes: Vec<RemoteChange>,
}

/// HTTP 状态码 → 错误分类
pub(crate) fn status_error(status: StatusCode, body: &str) -> FintrackError {
    let message = format!("HTTP {}: {}", status.as_u16(), body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FintrackError::Auth(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FintrackError::Network(message),
        s if s.is_client_error() => FintrackError::Validation(message),
        _ => FintrackError::Network(message),
    }
}

/// `after` 参数：`type:sequence` 逗号分隔
fn encode_cursors(types: &[EntityType], cursors: &SyncCursors) -> String {
    types
        .iter()
        .map(|t| format!("{}:{}", t.as_str(), cursors.get(*t)))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug)]
struct Inner {
    client: Client,
    base_url: String,
    config: HttpClientConfig,
}

impl Inner {
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "无法读取错误信息".to_string());
        error!("❌ 同步请求失败，HTTP 状态码: {}, 错误: {}", status, body);
        Err(status_error(status, &body))
    }

    async fn poll_changes(&self, types: &[EntityType], cursors: &SyncCursors) -> Result<Vec<RemoteChange>> {
        let type_list = types.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(",");
        let wait = self.config.long_poll_secs;
        let request = self
            .client
            .get(format!("{}/sync/changes", self.base_url))
            .query(&[
                ("types", type_list),
                ("after", encode_cursors(types, cursors)),
                ("wait", wait.to_string()),
            ])
            // 服务端最多挂起 wait 秒，额外留出传输余量
            .timeout(Duration::from_secs(wait + 10));
        let response = Self::check(self.authorize(request).send().await?).await?;
        // 响应体读取 / 解析失败按网络错误处理（reqwest::Error → Network / Timeout）
        let body: ChangesResponse = response.json().await?;
        Ok(body.changes)
    }
}

/// 通过 HTTP 访问的远端存储
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    inner: Arc<Inner>,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| FintrackError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("✅ HTTP 远端存储已创建 (base_url: {})", base_url);
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                config,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }
}

struct PollState {
    inner: Arc<Inner>,
    types: Vec<EntityType>,
    cursors: SyncCursors,
    buffer: VecDeque<RemoteChange>,
    failed: bool,
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn apply_batch(&self, ops: Vec<RemoteOperation>) -> Result<Vec<ApplyResult>> {
        debug!("📤 POST /sync/batch: {} 条操作", ops.len());
        let request = self
            .inner
            .client
            .post(format!("{}/sync/batch", self.inner.base_url))
            .json(&BatchRequest { operations: &ops });
        let response = Inner::check(self.inner.authorize(request).send().await?).await?;
        // 服务端可能已应用，截断的响应体不能当作永久失败
        let body: BatchResponse = response.json().await?;
        Ok(body.results)
    }

    async fn subscribe_changes(
        &self,
        entity_types: &[EntityType],
        from: &SyncCursors,
    ) -> Result<ChangeStream> {
        let state = PollState {
            inner: self.inner.clone(),
            types: entity_types.to_vec(),
            cursors: from.clone(),
            buffer: VecDeque::new(),
            failed: false,
        };

        // 出错后产出一次错误并结束，由调用方从最新游标重新订阅
        let stream = stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            loop {
                if let Some(change) = state.buffer.pop_front() {
                    state.cursors.advance(change.entity_type, change.sequence);
                    return Some((Ok(change), state));
                }
                match state.inner.poll_changes(&state.types, &state.cursors).await {
                    Ok(changes) => state.buffer.extend(changes),
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::UNAUTHORIZED, "").is_auth());
        assert!(status_error(StatusCode::FORBIDDEN, "").is_auth());
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad amount"),
            FintrackError::Validation(_)
        ));
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
    }

    #[test]
    fn test_cursor_query_encoding() {
        let mut cursors = SyncCursors::new();
        cursors.advance(EntityType::Budget, 12);
        assert_eq!(
            encode_cursors(&[EntityType::Account, EntityType::Budget], &cursors),
            "account:0,budget:12"
        );
    }

    #[test]
    fn test_batch_body_shape() {
        let ops = vec![RemoteOperation {
            op_id: "op-1".to_string(),
            entity_type: EntityType::Transaction,
            entity_id: "tx-1".to_string(),
            kind: crate::storage::OperationKind::Create,
            payload: json!({"amount": 12}),
            base_revision: None,
        }];
        let body = serde_json::to_value(BatchRequest { operations: &ops }).unwrap();
        assert_eq!(body["operations"][0]["kind"], "create");
        assert_eq!(body["operations"][0]["base_revision"], serde_json::Value::Null);

        let parsed: ChangesResponse = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.changes.is_empty());
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let store = HttpRemoteStore::new("https://api.example.com/", HttpClientConfig::default()).unwrap();
        assert_eq!(store.base_url(), "https://api.example.com");
    }
}
