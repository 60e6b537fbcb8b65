//! 流水线错误类型
//!
//! 除 `MetadataUnavailable` 外均为运行级致命错误，直接上抛到顶层，
//! 由顶层通过完成回调报告失败。

use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

/// 流水线错误
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 元数据解析失败（可恢复：回退为占位元数据）
    #[error("元数据不可用: {0}")]
    MetadataUnavailable(String),

    /// 下载停滞
    #[error("下载停滞: {idle:?} 内无任何进展")]
    DownloadStalled { idle: Duration },

    /// 超出总时间预算
    #[error("下载超时: 超过时间预算 {budget:?}")]
    DownloadTimedOut { budget: Duration },

    /// 引擎报告失败（非零退出码）
    #[error("下载失败: code={code}, {message}")]
    DownloadFailed { code: String, message: String },

    /// 下载完成但没有产出文件
    #[error("下载目录中没有找到任何文件: {0}")]
    NoFilesProduced(String),

    /// 分片上传失败
    #[error("分片上传失败: file={file}, bytes={}-{}, {source}", range.start, range.end.saturating_sub(1))]
    UploadChunkFailed {
        file: String,
        range: Range<u64>,
        #[source]
        source: anyhow::Error,
    },

    /// 令牌刷新失败
    #[error("访问令牌刷新失败: {0}")]
    TokenRefreshFailed(String),

    /// 引擎控制接口错误
    #[error("下载引擎错误: {0}")]
    Engine(#[source] anyhow::Error),

    /// 存储接口错误（非分片阶段，如创建会话、小文件直传）
    #[error("存储接口错误: {0}")]
    Storage(#[source] anyhow::Error),

    /// 本地 IO 错误
    #[error("本地文件错误: {0}")]
    Io(#[from] std::io::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl PipelineError {
    /// 是否为运行级致命错误
    pub fn is_run_fatal(&self) -> bool {
        !matches!(self, PipelineError::MetadataUnavailable(_))
    }

    /// 用于回调的简短错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MetadataUnavailable(_) => "metadata_unavailable",
            PipelineError::DownloadStalled { .. } => "download_stalled",
            PipelineError::DownloadTimedOut { .. } => "download_timed_out",
            PipelineError::DownloadFailed { .. } => "download_failed",
            PipelineError::NoFilesProduced(_) => "no_files_produced",
            PipelineError::UploadChunkFailed { .. } => "upload_chunk_failed",
            PipelineError::TokenRefreshFailed(_) => "token_refresh_failed",
            PipelineError::Engine(_) => "engine_error",
            PipelineError::Storage(_) => "storage_error",
            PipelineError::Io(_) => "io_error",
            PipelineError::Config(_) => "config_error",
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
