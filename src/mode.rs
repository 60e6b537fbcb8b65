//! 流水线模式选择
//!
//! | 总大小   | 文件数 | 模式       |
//! |---------|-------|------------|
//! | <= T    | 任意   | Bulk       |
//! | > T     | 1     | Streaming  |
//! | > T     | > 1   | Sequential |

use serde::{Deserialize, Serialize};
use std::fmt;

/// 流水线模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// 先完整下载，再逐个上传
    Bulk,
    /// 单文件边下边传
    Streaming,
    /// 多文件逐个下载、上传、删除
    Sequential,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMode::Bulk => write!(f, "bulk"),
            PipelineMode::Streaming => write!(f, "streaming"),
            PipelineMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// 根据总大小和文件数选择模式
pub fn select_mode(total_size: u64, file_count: usize, threshold: u64) -> PipelineMode {
    if total_size <= threshold {
        PipelineMode::Bulk
    } else if file_count <= 1 {
        PipelineMode::Streaming
    } else {
        PipelineMode::Sequential
    }
}
