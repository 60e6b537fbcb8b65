// 传输任务数据模型
//
// TransferTask / TorrentMetadata 在一次运行中只创建一次，之后只读；
// UploadedFileRecord 按完成顺序追加，作为整个流水线的最终输出。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 传输任务（运行期间不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    /// 任务ID（回调时原样带回）
    pub id: String,
    /// 磁力链接
    pub magnet: String,
    /// Tracker 列表（为空时由引擎自行发现）
    #[serde(default)]
    pub trackers: Vec<String>,
    /// 网盘目标路径前缀，如 "/Relay/2024"
    pub dest_prefix: String,
    /// 总时间预算
    #[serde(with = "duration_secs")]
    pub time_budget: Duration,
    /// 停滞超时预算（无进展超过此时间视为停滞）
    #[serde(with = "duration_secs")]
    pub stall_timeout: Duration,
}

/// 种子内单个文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// 文件索引（从 1 开始，与下载引擎的 select-file 一致）
    pub index: usize,
    /// 相对路径（含种子根目录以下的子目录）
    pub relative_path: String,
    /// 文件大小
    pub size: u64,
}

/// 种子元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentMetadata {
    /// 种子名称
    pub name: String,
    /// 总大小
    pub total_size: u64,
    /// 文件数量
    pub file_count: usize,
    /// 文件列表（按种子内顺序）
    pub files: Vec<FileEntry>,
    /// 是否为占位元数据（解析失败时的保守回退）
    #[serde(default)]
    pub placeholder: bool,
}

/// 已上传文件记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFileRecord {
    pub file_name: String,
    pub file_size: u64,
    pub remote_item_id: String,
    pub remote_path: String,
}

/// 运行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// 解析元数据
    Metadata,
    /// 下载中
    Downloading,
    /// 边下边传
    Streaming,
    /// 上传中
    Uploading,
    /// 完成
    Completed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Metadata => "metadata",
            Phase::Downloading => "downloading",
            Phase::Streaming => "streaming",
            Phase::Uploading => "uploading",
            Phase::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// 进度快照（仅转发，不持久化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    /// 已下载字节数
    pub downloaded: u64,
    /// 总字节数
    pub total: u64,
    /// 已上传字节数
    pub uploaded: u64,
    /// 下载速度 (bytes/s)
    pub speed: u64,
    /// 附加说明（当前文件名等）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressSnapshot {
    /// 计算进度百分比
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.downloaded as f64 / self.total as f64) * 100.0
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 || self.downloaded >= self.total {
            return None;
        }
        Some((self.total - self.downloaded) / self.speed)
    }
}

/// 以秒为单位序列化 Duration
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
