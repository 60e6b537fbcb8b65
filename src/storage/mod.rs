// 网盘存储接口
//
// 上传调度器只依赖 ObjectStorage trait：
// - 小文件整体直传
// - 创建可续传的上传会话
// - 按严格递增、连续的字节范围向会话上传

pub mod auth;
pub mod graph;

use crate::error::PipelineResult;
use async_trait::async_trait;
use std::ops::Range;

pub use auth::TokenProvider;
pub use graph::GraphStorage;

/// 上传完成后网盘返回的文件信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    /// 网盘文件 ID
    pub id: String,
    /// 规范化后的网盘路径
    pub path: String,
}

/// 上传会话
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// 会话上传地址
    pub url: String,
    /// 目标路径
    pub remote_path: String,
}

/// 单个范围上传的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeOutcome {
    /// 已接收，服务器期望的下一个起始偏移
    Accepted { next_expected: u64 },
    /// 最后一个范围，文件已合并完成
    Completed(RemoteItem),
}

/// 网盘存储
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// 小文件整体上传
    async fn put_small(&self, remote_path: &str, data: Vec<u8>) -> PipelineResult<RemoteItem>;

    /// 创建上传会话
    async fn create_upload_session(&self, remote_path: &str) -> PipelineResult<UploadSession>;

    /// 上传 `range` 范围的数据，`total` 为文件总大小
    async fn upload_range(
        &self,
        session: &UploadSession,
        range: Range<u64>,
        total: u64,
        data: Vec<u8>,
    ) -> PipelineResult<RangeOutcome>;
}

/// 上传错误分类（仅用于诊断，不触发重试）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    /// 网络错误
    Network,
    /// 超时
    Timeout,
    /// 服务器错误
    ServerError,
    /// 限流
    RateLimited,
    /// 会话或文件不存在
    NotFound,
    /// 权限不足
    Forbidden,
    /// 参数错误（含范围不连续）
    BadRequest,
    /// 空间不足
    QuotaExceeded,
    /// 未知错误
    Unknown,
}

impl UploadErrorKind {
    /// 从 HTTP 状态码分类
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 409 | 416 => UploadErrorKind::BadRequest,
            401 | 403 => UploadErrorKind::Forbidden,
            404 | 410 => UploadErrorKind::NotFound,
            408 | 504 => UploadErrorKind::Timeout,
            429 => UploadErrorKind::RateLimited,
            507 => UploadErrorKind::QuotaExceeded,
            500..=599 => UploadErrorKind::ServerError,
            _ => UploadErrorKind::Unknown,
        }
    }

    /// 从传输层错误分类
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadErrorKind::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            UploadErrorKind::Network
        } else {
            UploadErrorKind::Unknown
        }
    }
}

/// 网盘 HTTP 失败
#[derive(Debug, thiserror::Error)]
#[error("HTTP {status} ({kind:?}): {body}")]
pub struct HttpFailure {
    pub status: u16,
    pub kind: UploadErrorKind,
    pub body: String,
}

impl HttpFailure {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            kind: UploadErrorKind::from_status(status),
            body: body.into(),
        }
    }
}

/// 网盘不接受的字符
const FORBIDDEN_CHARS: &[char] = &['"', '*', ':', '<', '>', '?', '\\', '|'];

/// 替换单个路径段中网盘不接受的字符
pub fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| if FORBIDDEN_CHARS.contains(&c) { '_' } else { c })
        .collect();
    cleaned.trim().to_string()
}

/// 计算远端路径
///
/// 结果形如 `{dest_prefix}/{name}/{relative}`；当相对路径本身已以种子名开头
/// （多文件种子的目录布局，或单文件种子的文件名）时不再重复种子名。
pub fn remote_path(dest_prefix: &str, name: &str, relative: &str) -> String {
    let relative = relative.replace('\\', "/");
    let mut segments: Vec<String> = dest_prefix
        .split('/')
        .filter(|s| !s.is_empty())
        .map(sanitize_segment)
        .collect();

    let relative_segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
    if relative_segments.first() != Some(&name) {
        segments.push(sanitize_segment(name));
    }
    segments.extend(relative_segments.into_iter().map(sanitize_segment));
    segments.retain(|s| !s.is_empty());

    format!("/{}", segments.join("/"))
}

pub(crate) mod bytes_range {
    use std::ops::Range;

    /// `Content-Range` 头：`bytes a-b/total`（b 为闭区间终点）
    pub fn content_range(range: &Range<u64>, total: u64) -> String {
        format!(
            "bytes {}-{}/{}",
            range.start,
            range.end.saturating_sub(1),
            total
        )
    }

    /// 解析 `nextExpectedRanges` 中的第一个起始偏移，如 "26-" 或 "26-99"
    pub fn parse_next_expected(ranges: &[String]) -> Option<u64> {
        ranges
            .first()
            .and_then(|r| r.split('-').next())
            .and_then(|start| start.trim().parse().ok())
    }
}
