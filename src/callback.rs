//! 完成 / 进度回调
//!
//! 运行结束时向控制服务 POST 完成记录；运行期间向进度地址 POST 限频后的进度记录。
//! 两个地址都是可选的，未配置时只写日志。

use crate::config::CallbackConfig;
use crate::progress::ProgressSink;
use crate::task::{Phase, ProgressSnapshot, UploadedFileRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// 运行结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// 完成记录
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub task_id: String,
    pub status: CompletionStatus,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub files: Vec<UploadedFileRecord>,
}

impl CompletionRecord {
    pub fn completed(task_id: &str, name: &str, files: Vec<UploadedFileRecord>) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: CompletionStatus::Completed,
            name: name.to_string(),
            error: None,
            files,
        }
    }

    pub fn failed(task_id: &str, name: &str, error: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: CompletionStatus::Failed,
            name: name.to_string(),
            error: Some(error),
            files: Vec::new(),
        }
    }
}

/// 进度记录
#[derive(Debug, Clone, Serialize)]
pub struct ProgressRecord<'a> {
    pub task_id: &'a str,
    pub phase: Phase,
    pub downloaded: u64,
    pub total: u64,
    pub percent: f64,
    pub speed: u64,
    pub eta_secs: Option<u64>,
    pub message: Option<&'a str>,
}

impl<'a> ProgressRecord<'a> {
    pub fn new(task_id: &'a str, snapshot: &'a ProgressSnapshot) -> Self {
        Self {
            task_id,
            phase: snapshot.phase,
            downloaded: snapshot.downloaded,
            total: snapshot.total,
            percent: (snapshot.percent() * 10.0).round() / 10.0,
            speed: snapshot.speed,
            eta_secs: snapshot.eta(),
            message: snapshot.message.as_deref(),
        }
    }
}

/// 回调客户端
pub struct CallbackClient {
    client: Client,
    task_id: String,
    completion_url: Option<String>,
    progress_url: Option<String>,
}

impl CallbackClient {
    pub fn new(config: &CallbackConfig, task_id: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("创建回调 HTTP 客户端失败")?;
        Ok(Self {
            client,
            task_id: task_id.to_string(),
            completion_url: config.completion_url.clone().filter(|u| !u.is_empty()),
            progress_url: config.progress_url.clone().filter(|u| !u.is_empty()),
        })
    }

    /// 发送完成记录
    pub async fn post_completion(&self, record: &CompletionRecord) -> Result<()> {
        let Some(url) = &self.completion_url else {
            info!(
                "未配置完成回调，结果: status={:?}, files={}",
                record.status,
                record.files.len()
            );
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(record)
            .send()
            .await
            .context("发送完成回调失败")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("完成回调返回 HTTP {}: {}", status.as_u16(), body);
        }
        info!("完成回调已发送: status={:?}", record.status);
        Ok(())
    }
}

#[async_trait]
impl ProgressSink for CallbackClient {
    async fn deliver(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let record = ProgressRecord::new(&self.task_id, snapshot);
        let Some(url) = &self.progress_url else {
            info!(
                "[{}] {}/{} ({:.1}%)",
                record.phase, record.downloaded, record.total, record.percent
            );
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&record)
            .send()
            .await
            .context("发送进度回调失败")?;
        if !response.status().is_success() {
            warn!("进度回调返回 HTTP {}", response.status().as_u16());
        }
        Ok(())
    }
}
