// Magnet Relay Library
// 磁力链接 -> 网盘 传输流水线核心库

// 数据模型与错误
pub mod error;
pub mod task;

// 配置与日志
pub mod config;
pub mod logging;

// 下载引擎控制面
pub mod engine;

// 元数据解析与模式选择
pub mod metadata;
pub mod mode;

// 下载监督
pub mod supervisor;

// 分片可用性与磁盘背压
pub mod backpressure;
pub mod gate;

// 网盘存储与上传
pub mod storage;
pub mod uploader;

// 进度与回调
pub mod callback;
pub mod progress;

// 流水线编排
pub mod pipeline;

#[cfg(test)]
pub mod testing;

// 导出常用类型
pub use config::AppConfig;
pub use engine::{Aria2Engine, DownloadEngine, EngineStatus};
pub use error::{PipelineError, PipelineResult};
pub use mode::{select_mode, PipelineMode};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use storage::{GraphStorage, ObjectStorage};
pub use task::{Phase, ProgressSnapshot, TorrentMetadata, TransferTask, UploadedFileRecord};
