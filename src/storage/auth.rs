// 访问令牌
//
// 用长期有效的 refresh token + 客户端凭据换取短期 bearer token（OAuth2 refresh grant），
// 在过期前一段时间内复用缓存。刷新失败不重试，直接映射为 TokenRefreshFailed。

use crate::config::StorageConfig;
use crate::error::{PipelineError, PipelineResult};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 提前刷新的余量
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// 令牌端点响应
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
    /// 部分端点会轮换 refresh token
    #[serde(default)]
    refresh_token: Option<String>,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug)]
struct TokenState {
    refresh_token: String,
    access_token: Option<String>,
    expires_at: Instant,
}

/// 令牌提供者
#[derive(Debug)]
pub struct TokenProvider {
    client: Client,
    endpoint: String,
    client_id: String,
    client_secret: String,
    state: Mutex<TokenState>,
}

impl TokenProvider {
    pub fn new(client: Client, config: &StorageConfig) -> Self {
        Self {
            client,
            endpoint: config.token_endpoint.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            state: Mutex::new(TokenState {
                refresh_token: config.refresh_token.clone(),
                access_token: None,
                expires_at: Instant::now(),
            }),
        }
    }

    /// 获取有效的 bearer token
    pub async fn bearer(&self) -> PipelineResult<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = &state.access_token {
            if Instant::now() + REFRESH_MARGIN < state.expires_at {
                return Ok(token.clone());
            }
        }

        debug!("刷新访问令牌: endpoint={}", self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", state.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::TokenRefreshFailed(format!("请求失败: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::TokenRefreshFailed(format!("读取响应失败: {}", e)))?;
        if !status.is_success() {
            return Err(PipelineError::TokenRefreshFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            PipelineError::TokenRefreshFailed(format!("解析响应失败: {}, body={}", e, body))
        })?;

        info!("访问令牌已刷新，有效期 {} 秒", token.expires_in);
        if let Some(rotated) = token.refresh_token {
            state.refresh_token = rotated;
        }
        state.expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        state.access_token = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    /// 令牌被服务端拒绝时作废缓存
    pub async fn invalidate(&self) {
        self.state.lock().await.access_token = None;
    }
}
