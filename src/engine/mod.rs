// 下载引擎控制接口
//
// 协调器只依赖 DownloadEngine trait；真正的 BT 协议由外部引擎（aria2c）负责。

pub mod aria2;
pub mod console;

use crate::task::FileEntry;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use aria2::Aria2Engine;
pub use console::{parse_progress_line, parse_size, ConsoleProgress};

/// 引擎侧任务句柄（aria2 的 gid）
pub type Gid = String;

/// 启动请求
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// 磁力链接
    pub source: String,
    /// 下载目录
    pub dir: PathBuf,
    /// Tracker 列表
    pub trackers: Vec<String>,
    /// 只下载指定文件（1 起始索引），None 表示全部
    pub select_files: Option<Vec<usize>>,
    /// 额外调优参数（aria2 选项名 -> 值）
    pub tuning: Vec<(String, String)>,
}

/// 引擎报告的任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Active,
    Waiting,
    Paused,
    Error,
    Complete,
    Removed,
}

impl EngineState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => EngineState::Active,
            "waiting" => EngineState::Waiting,
            "paused" => EngineState::Paused,
            "complete" => EngineState::Complete,
            "removed" => EngineState::Removed,
            _ => EngineState::Error,
        }
    }
}

/// 结构化状态查询结果
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: EngineState,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub connections: u32,
    /// 分片完成位图（十六进制），元数据阶段为空
    pub bitfield: Option<String>,
    pub piece_length: u64,
    pub files: Vec<FileEntry>,
    /// 非零表示失败
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// 元数据下载完成后衍生出的真实下载任务
    pub followed_by: Vec<Gid>,
    /// 种子名称（元数据解析后可用）
    pub name: Option<String>,
    /// 元数据下载阶段：大小和位图属于元数据本身，而不是种子内容
    pub metadata_phase: bool,
    /// 由控制台输出估算（大小已取整，没有位图和文件列表）
    pub estimated: bool,
}

impl EngineStatus {
    /// 是否描述了种子内容的真实布局（可用于校验大小和推进上传）
    pub fn describes_content(&self) -> bool {
        !self.metadata_phase && !self.estimated
    }

    /// 引擎是否报告了非零错误码
    pub fn failed(&self) -> bool {
        self.state == EngineState::Error
            || self
                .error_code
                .as_deref()
                .map(|c| c != "0")
                .unwrap_or(false)
    }
}

/// 元数据探测结果
///
/// 文件数可能来自两个独立信号：汇总计数和显式文件列表。
#[derive(Debug, Clone, Default)]
pub struct MetadataProbe {
    pub name: Option<String>,
    pub total_length: Option<u64>,
    /// 汇总文件计数
    pub declared_file_count: Option<usize>,
    /// 显式文件列表
    pub files: Vec<FileEntry>,
}

/// 下载引擎控制面
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// 启动下载，返回任务句柄
    async fn start(&self, request: StartRequest) -> Result<Gid>;

    /// 查询状态
    async fn status(&self, gid: &str) -> Result<EngineStatus>;

    /// 暂停
    async fn pause(&self, gid: &str) -> Result<()>;

    /// 恢复
    async fn unpause(&self, gid: &str) -> Result<()>;

    /// 强制移除任务（终止下载）
    async fn remove(&self, gid: &str) -> Result<()>;

    /// 仅获取元数据，不下载内容
    ///
    /// 超过 `timeout` 即放弃；无论成败，探测期间在引擎中登记的任务都要清理掉。
    async fn probe_metadata(
        &self,
        source: &str,
        trackers: &[String],
        timeout: Duration,
    ) -> Result<MetadataProbe>;

    /// 关闭引擎进程
    async fn shutdown(&self) -> Result<()>;
}
