// 配置管理模块
//
// 加载顺序：默认值 -> TOML 配置文件（可选） -> 环境变量覆盖

use crate::task::TransferTask;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// 远端分段上传要求的字节粒度（320 KiB）
pub const RANGE_GRANULARITY: u64 = 320 * 1024;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/relay.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 任务输入
    #[serde(default)]
    pub task: TaskConfig,
    /// 流水线参数
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// 下载引擎配置
    #[serde(default)]
    pub engine: EngineConfig,
    /// 网盘存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 回调配置
    #[serde(default)]
    pub callback: CallbackConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 任务输入（通常由环境变量注入）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// 任务ID，为空时自动生成
    #[serde(default)]
    pub id: String,
    /// 磁力链接
    #[serde(default)]
    pub magnet: String,
    /// Tracker 覆盖列表
    #[serde(default)]
    pub trackers: Vec<String>,
    /// 网盘目标路径前缀
    #[serde(default = "default_dest_prefix")]
    pub dest_prefix: String,
    /// 总时间预算（秒），默认 6 小时
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
    /// 停滞超时（秒），默认 10 分钟
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

fn default_dest_prefix() -> String {
    "/Relay".to_string()
}

fn default_time_budget_secs() -> u64 {
    6 * 3600
}

fn default_stall_timeout_secs() -> u64 {
    600
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            magnet: String::new(),
            trackers: Vec::new(),
            dest_prefix: default_dest_prefix(),
            time_budget_secs: default_time_budget_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
        }
    }
}

impl TaskConfig {
    /// 构建不可变的传输任务
    pub fn to_task(&self) -> TransferTask {
        let id = if self.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.id.clone()
        };
        TransferTask {
            id,
            magnet: self.magnet.clone(),
            trackers: self.trackers.clone(),
            dest_prefix: self.dest_prefix.clone(),
            time_budget: Duration::from_secs(self.time_budget_secs),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
        }
    }
}

/// 流水线参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 模式阈值 T：总大小 <= T 走 Bulk 模式
    #[serde(default = "default_mode_threshold")]
    pub mode_threshold: u64,
    /// 分段上传块大小（必须是 320 KiB 的整数倍）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 小文件直传阈值
    #[serde(default = "default_small_object_threshold")]
    pub small_object_threshold: u64,
    /// 状态轮询 / 上传轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 停滞检测间隔（毫秒）
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// 磁盘低水位：低于此值暂停下载
    #[serde(default = "default_low_watermark")]
    pub low_watermark: u64,
    /// 磁盘高水位：高于此值恢复下载
    #[serde(default = "default_high_watermark")]
    pub high_watermark: u64,
    /// 上传后对本地已上传区域打洞释放空间
    #[serde(default = "default_punch_holes")]
    pub punch_holes: bool,
    /// 进度上报最小间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_mode_threshold() -> u64 {
    27 * GIB / 2 // 13.5 GiB
}
fn default_chunk_size() -> u64 {
    30 * MIB
}
fn default_small_object_threshold() -> u64 {
    4 * MIB
}
fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_liveness_interval_ms() -> u64 {
    30_000
}
fn default_low_watermark() -> u64 {
    2 * GIB
}
fn default_high_watermark() -> u64 {
    4 * GIB
}
fn default_punch_holes() -> bool {
    true
}
fn default_progress_interval_ms() -> u64 {
    10_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode_threshold: default_mode_threshold(),
            chunk_size: default_chunk_size(),
            small_object_threshold: default_small_object_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
            punch_holes: default_punch_holes(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// 下载引擎配置（aria2c）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// aria2c 可执行文件路径
    #[serde(default = "default_aria2c_path")]
    pub aria2c_path: PathBuf,
    /// 本地下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// RPC 监听端口
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// RPC 密钥，为空时启动时随机生成
    #[serde(default)]
    pub rpc_secret: String,
    /// 单任务最大连接数
    #[serde(default = "default_max_peers")]
    pub max_peers: u32,
    /// 元数据解析超时（秒）
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    /// 额外命令行参数
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_aria2c_path() -> PathBuf {
    PathBuf::from("aria2c")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_rpc_port() -> u16 {
    6800
}
fn default_max_peers() -> u32 {
    80
}
fn default_metadata_timeout_secs() -> u64 {
    180
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            aria2c_path: default_aria2c_path(),
            download_dir: default_download_dir(),
            rpc_port: default_rpc_port(),
            rpc_secret: String::new(),
            max_peers: default_max_peers(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

/// 网盘存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: String,
    /// OAuth2 令牌端点
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    /// 网盘 API 根地址（指向 drive）
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_token_endpoint() -> String {
    "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string()
}
fn default_api_base() -> String {
    "https://graph.microsoft.com/v1.0/me/drive".to_string()
}
fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: String::new(),
            token_endpoint: default_token_endpoint(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 回调配置（均为可选）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// 完成回调地址
    #[serde(default)]
    pub completion_url: Option<String>,
    /// 进度回调地址
    #[serde(default)]
    pub progress_url: Option<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_log_retention_days() -> u32 {
    7
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_max_file_size() -> u64 {
    50 * MIB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// 加载配置：文件不存在时使用默认值，然后应用环境变量覆盖
    pub async fn load(path: &str) -> Result<Self> {
        let mut config = if fs::try_exists(path).await.unwrap_or(false) {
            let config = Self::load_from_file(path).await?;
            tracing::info!("配置文件加载成功: {}", path);
            config
        } else {
            tracing::info!("未找到配置文件 {}，使用默认配置", path);
            Self::default()
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// 应用环境变量覆盖
    ///
    /// `lookup` 抽象出来便于测试
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TASK_ID") {
            self.task.id = v;
        }
        if let Some(v) = get("MAGNET") {
            self.task.magnet = v;
        }
        if let Some(v) = get("TRACKERS") {
            self.task.trackers = parse_list(&v);
        }
        if let Some(v) = get("DEST_PATH") {
            self.task.dest_prefix = v;
        }
        if let Some(v) = get("TIME_BUDGET_SECS").and_then(|v| v.parse().ok()) {
            self.task.time_budget_secs = v;
        }
        if let Some(v) = get("STALL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.task.stall_timeout_secs = v;
        }
        if let Some(v) = get("CLIENT_ID") {
            self.storage.client_id = v;
        }
        if let Some(v) = get("CLIENT_SECRET") {
            self.storage.client_secret = v;
        }
        if let Some(v) = get("REFRESH_TOKEN") {
            self.storage.refresh_token = v;
        }
        if let Some(v) = get("CALLBACK_URL") {
            self.callback.completion_url = Some(v);
        }
        if let Some(v) = get("PROGRESS_URL") {
            self.callback.progress_url = Some(v);
        }
        if let Some(v) = get("DOWNLOAD_DIR") {
            self.engine.download_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ARIA2C_PATH") {
            self.engine.aria2c_path = PathBuf::from(v);
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.task.magnet.trim().is_empty() {
            return Err("磁力链接不能为空".to_string());
        }
        if self.task.time_budget_secs == 0 || self.task.stall_timeout_secs == 0 {
            return Err("时间预算和停滞超时必须大于 0".to_string());
        }
        self.pipeline.validate()
    }
}

impl PipelineConfig {
    /// 校验流水线参数
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 || self.chunk_size % RANGE_GRANULARITY != 0 {
            return Err(format!(
                "分片大小 {} 必须是 {} 的整数倍",
                self.chunk_size, RANGE_GRANULARITY
            ));
        }
        if self.small_object_threshold >= self.chunk_size {
            return Err("小文件直传阈值必须小于分片大小".to_string());
        }
        if self.high_watermark <= self.low_watermark {
            return Err(format!(
                "磁盘高水位 {} 必须大于低水位 {}",
                self.high_watermark, self.low_watermark
            ));
        }
        if self.poll_interval_ms == 0 || self.liveness_interval_ms == 0 {
            return Err("轮询间隔必须大于 0".to_string());
        }
        Ok(())
    }
}

/// 解析逗号/换行分隔的列表
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(|c| c == ',' || c == '\n')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
