// Graph 风格网盘 API
//
// - 小文件：PUT {base}/root:/{path}:/content
// - 大文件：POST {base}/root:/{path}:/createUploadSession 得到 uploadUrl，
//   再对 uploadUrl 逐段 PUT，带 Content-Length 与 Content-Range 头。
//   中间段返回 202 + nextExpectedRanges，最后一段返回 200/201 + 文件信息。

use super::bytes_range::{content_range, parse_next_expected};
use super::{HttpFailure, ObjectStorage, RangeOutcome, RemoteItem, TokenProvider, UploadErrorKind, UploadSession};
use crate::config::StorageConfig;
use crate::error::{PipelineError, PipelineResult};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, error, info};

/// 网盘文件信息（只取用到的字段）
#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    name: String,
    #[serde(rename = "parentReference", default)]
    parent: Option<ParentReference>,
}

#[derive(Debug, Deserialize)]
struct ParentReference {
    #[serde(default)]
    path: Option<String>,
}

impl DriveItem {
    /// 父路径形如 "/drive/root:/Relay/Show"，去掉 "root:" 之前的部分
    fn into_remote(self, fallback_path: &str) -> RemoteItem {
        let parent = self
            .parent
            .and_then(|p| p.path)
            .map(|p| match p.split_once("root:") {
                Some((_, rest)) => rest.to_string(),
                None => p,
            });
        let path = match parent {
            Some(parent) => format!("{}/{}", parent.trim_end_matches('/'), self.name),
            None => fallback_path.to_string(),
        };
        RemoteItem { id: self.id, path }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeAccepted {
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

/// Graph 风格网盘客户端
pub struct GraphStorage {
    client: Client,
    api_base: String,
    tokens: TokenProvider,
}

impl GraphStorage {
    pub fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("创建 HTTP 客户端失败")?;
        let tokens = TokenProvider::new(client.clone(), config);
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// 形如 `{base}/root:/Relay/a%20b.mkv:{suffix}`
    fn item_url(&self, remote_path: &str, suffix: &str) -> String {
        let encoded: Vec<String> = remote_path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!("{}/root:/{}:{}", self.api_base, encoded.join("/"), suffix)
    }

    /// 非 2xx 响应转为带分类的错误
    async fn check(response: Response) -> anyhow::Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HttpFailure::new(status.as_u16(), body).into())
    }

    fn transport(err: reqwest::Error) -> anyhow::Error {
        let kind = UploadErrorKind::from_transport(&err);
        anyhow::Error::new(err).context(format!("网盘请求失败 ({:?})", kind))
    }
}

#[async_trait]
impl ObjectStorage for GraphStorage {
    async fn put_small(&self, remote_path: &str, data: Vec<u8>) -> PipelineResult<RemoteItem> {
        let token = self.tokens.bearer().await?;
        let size = data.len();
        let url = self.item_url(remote_path, "/content");
        debug!("小文件直传: path={}, size={}", remote_path, size);

        let result: anyhow::Result<RemoteItem> = async {
            let response = self
                .client
                .put(&url)
                .bearer_auth(&token)
                .header(CONTENT_LENGTH, size)
                .body(data)
                .send()
                .await
                .map_err(Self::transport)?;
            let response = Self::check(response).await?;
            let item: DriveItem = response.json().await.context("解析上传响应失败")?;
            Ok(item.into_remote(remote_path))
        }
        .await;

        if result.is_err() {
            self.tokens.invalidate().await;
        }
        let item = result
            .with_context(|| format!("小文件上传失败: {}", remote_path))
            .map_err(PipelineError::Storage)?;
        info!("小文件上传完成: path={}, id={}", item.path, item.id);
        Ok(item)
    }

    async fn create_upload_session(&self, remote_path: &str) -> PipelineResult<UploadSession> {
        let token = self.tokens.bearer().await?;
        let url = self.item_url(remote_path, "/createUploadSession");
        let body = json!({
            "item": { "@microsoft.graph.conflictBehavior": "rename" }
        });

        let result: anyhow::Result<SessionResponse> = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await
                .map_err(Self::transport)?;
            let response = Self::check(response).await?;
            Ok(response.json().await.context("解析上传会话响应失败")?)
        }
        .await;

        let session = result
            .with_context(|| format!("创建上传会话失败: {}", remote_path))
            .map_err(PipelineError::Storage)?;
        info!("上传会话已创建: path={}", remote_path);
        Ok(UploadSession {
            url: session.upload_url,
            remote_path: remote_path.to_string(),
        })
    }

    async fn upload_range(
        &self,
        session: &UploadSession,
        range: Range<u64>,
        total: u64,
        data: Vec<u8>,
    ) -> PipelineResult<RangeOutcome> {
        let header = content_range(&range, total);
        debug!("上传分段: path={}, {}", session.remote_path, header);

        // 会话地址自带授权，不附加 bearer token
        let result: anyhow::Result<RangeOutcome> = async {
            let response = self
                .client
                .put(&session.url)
                .header(CONTENT_LENGTH, data.len())
                .header(CONTENT_RANGE, &header)
                .body(data)
                .send()
                .await
                .map_err(Self::transport)?;
            let response = Self::check(response).await?;
            if response.status() == StatusCode::ACCEPTED {
                let accepted: RangeAccepted =
                    response.json().await.context("解析分段响应失败")?;
                let next_expected =
                    parse_next_expected(&accepted.next_expected_ranges).unwrap_or(range.end);
                Ok(RangeOutcome::Accepted { next_expected })
            } else {
                let item: DriveItem = response.json().await.context("解析完成响应失败")?;
                Ok(RangeOutcome::Completed(item.into_remote(&session.remote_path)))
            }
        }
        .await;

        result.map_err(|e| {
            error!("分段上传失败: path={}, {}, {:#}", session.remote_path, header, e);
            PipelineError::Storage(e)
        })
    }
}
