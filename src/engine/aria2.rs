// aria2c JSON-RPC 引擎适配器
//
// 核心功能：
// 1. 以子进程方式启动 aria2c（--enable-rpc），进程随引擎对象销毁而终止
// 2. 通过 JSON-RPC 2.0 (HTTP) 控制下载：addUri / tellStatus / pause / unpause / forceRemove
// 3. 消费子进程标准输出，解析控制台进度作为 RPC 失败时的后备数据源

use crate::config::EngineConfig;
use crate::engine::console::{parse_progress_line, ConsoleProgress};
use crate::engine::{
    DownloadEngine, EngineState, EngineStatus, Gid, MetadataProbe, StartRequest,
};
use crate::task::FileEntry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// RPC 就绪探测次数
const RPC_READY_ATTEMPTS: u32 = 50;

/// RPC 就绪探测间隔
const RPC_READY_INTERVAL: Duration = Duration::from_millis(200);

/// 元数据探测轮询间隔
const PROBE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 控制台最近进度（标准输出关闭后清空）
type ConsoleSlot = Arc<Mutex<Option<ConsoleProgress>>>;

/// tellStatus 请求的字段
const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "connections",
    "bitfield",
    "pieceLength",
    "files",
    "errorCode",
    "errorMessage",
    "followedBy",
    "bittorrent",
    "dir",
];

/// JSON-RPC 响应
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// tellStatus 原始结构（aria2 所有数字都是字符串）
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    status: String,
    #[serde(default)]
    total_length: String,
    #[serde(default)]
    completed_length: String,
    #[serde(default)]
    download_speed: String,
    #[serde(default)]
    connections: String,
    #[serde(default)]
    bitfield: Option<String>,
    #[serde(default)]
    piece_length: String,
    #[serde(default)]
    files: Vec<RawFile>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    followed_by: Vec<String>,
    #[serde(default)]
    bittorrent: Option<RawBittorrent>,
    #[serde(default)]
    dir: String,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    index: String,
    path: String,
    length: String,
}

#[derive(Debug, Deserialize)]
struct RawBittorrent {
    #[serde(default)]
    info: Option<RawInfo>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
}

fn num(raw: &str) -> u64 {
    raw.parse().unwrap_or(0)
}

impl RawStatus {
    fn into_status(self) -> EngineStatus {
        let dir = self.dir.clone();
        let metadata_phase = self.files.iter().any(|f| f.path.starts_with("[METADATA]"));
        let files = self
            .files
            .iter()
            // 元数据阶段的伪文件 "[METADATA]..." 没有真实路径
            .filter(|f| !f.path.is_empty() && !f.path.starts_with("[METADATA]"))
            .map(|f| FileEntry {
                index: f.index.parse().unwrap_or(0),
                relative_path: relative_to(&f.path, &dir),
                size: num(&f.length),
            })
            .collect();

        EngineStatus {
            state: EngineState::parse(&self.status),
            total_length: num(&self.total_length),
            completed_length: num(&self.completed_length),
            download_speed: num(&self.download_speed),
            connections: num(&self.connections) as u32,
            bitfield: self.bitfield.filter(|b| !b.is_empty()),
            piece_length: num(&self.piece_length),
            files,
            error_code: self.error_code,
            error_message: self.error_message,
            followed_by: self.followed_by,
            name: self.bittorrent.and_then(|b| b.info).map(|i| i.name),
            metadata_phase,
            estimated: false,
        }
    }
}

/// 消费 aria2c 标准输出，持续记录最近一条进度
///
/// 输出关闭（进程退出）时清空记录，避免过期进度继续充当状态。
fn watch_console(stdout: ChildStdout, console: ConsoleSlot) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // 终端模式下一行内可能有多段 \r 刷新
            for segment in line.split('\r') {
                if let Some(progress) = parse_progress_line(segment) {
                    *console.lock() = Some(progress);
                } else if !segment.trim().is_empty() {
                    debug!("aria2c: {}", segment.trim());
                }
            }
        }
        console.lock().take();
        debug!("aria2c 标准输出已关闭");
    })
}

/// 把引擎报告的绝对路径转换为相对于下载目录的路径
fn relative_to(path: &str, dir: &str) -> String {
    Path::new(path)
        .strip_prefix(dir)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| path.trim_start_matches('/').to_string())
}

/// aria2 引擎
pub struct Aria2Engine {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
    /// 子进程（连接外部 aria2 时为 None）
    child: tokio::sync::Mutex<Option<Child>>,
    /// 最近一次解析到的控制台进度
    console: ConsoleSlot,
}

impl Aria2Engine {
    /// 启动 aria2c 子进程并等待 RPC 就绪
    pub async fn spawn(config: &EngineConfig) -> Result<Self> {
        let secret = if config.rpc_secret.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            config.rpc_secret.clone()
        };

        tokio::fs::create_dir_all(&config.download_dir)
            .await
            .with_context(|| format!("创建下载目录失败: {:?}", config.download_dir))?;

        let mut command = Command::new(&config.aria2c_path);
        command
            .arg("--enable-rpc=true")
            .arg("--rpc-listen-all=false")
            .arg(format!("--rpc-listen-port={}", config.rpc_port))
            .arg(format!("--rpc-secret={}", secret))
            .arg(format!("--dir={}", config.download_dir.display()))
            .arg(format!("--bt-max-peers={}", config.max_peers))
            .arg("--seed-time=0")
            .arg("--bt-save-metadata=false")
            .arg("--file-allocation=none")
            .arg("--summary-interval=5")
            .arg("--console-log-level=warn")
            .args(&config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("启动 aria2c 失败: {:?}", config.aria2c_path))?;
        info!(
            "aria2c 已启动: pid={:?}, rpc_port={}",
            child.id(),
            config.rpc_port
        );

        let console: ConsoleSlot = Arc::new(Mutex::new(None));
        if let Some(stdout) = child.stdout.take() {
            watch_console(stdout, console.clone());
        }

        let engine = Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .context("Failed to create HTTP client")?,
            endpoint: format!("http://127.0.0.1:{}/jsonrpc", config.rpc_port),
            secret,
            child: tokio::sync::Mutex::new(Some(child)),
            console,
        };
        engine.wait_ready().await?;
        Ok(engine)
    }

    /// 连接一个已在运行的 aria2 RPC 服务
    #[cfg(test)]
    fn connect(endpoint: &str, secret: &str) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .context("Failed to create HTTP client")?,
            endpoint: endpoint.to_string(),
            secret: secret.to_string(),
            child: tokio::sync::Mutex::new(None),
            console: Arc::new(Mutex::new(None)),
        })
    }

    /// 等待 RPC 接口可用
    async fn wait_ready(&self) -> Result<()> {
        for attempt in 1..=RPC_READY_ATTEMPTS {
            match self.call("aria2.getVersion", vec![]).await {
                Ok(reply) => {
                    let version = reply
                        .get("version")
                        .and_then(|v| v.as_str())
                        .unwrap_or("?");
                    info!("aria2 RPC 就绪: version={}", version);
                    return Ok(());
                }
                Err(e) => {
                    debug!("等待 aria2 RPC 就绪 ({}/{}): {}", attempt, RPC_READY_ATTEMPTS, e);
                    tokio::time::sleep(RPC_READY_INTERVAL).await;
                }
            }
        }
        anyhow::bail!("aria2 RPC 在 {} 次探测后仍不可用", RPC_READY_ATTEMPTS)
    }

    /// 调用 RPC 方法（自动带上 token 参数）
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut all_params = Vec::with_capacity(params.len() + 1);
        all_params.push(Value::String(format!("token:{}", self.secret)));
        all_params.extend(params);

        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": all_params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("RPC 请求发送失败: {}", method))?;

        let rpc: RpcResponse = response
            .json()
            .await
            .with_context(|| format!("解析 RPC 响应失败: {}", method))?;

        if let Some(err) = rpc.error {
            anyhow::bail!("{} 失败: code={}, {}", method, err.code, err.message);
        }
        rpc.result
            .ok_or_else(|| anyhow::anyhow!("{} 返回空结果", method))
    }

    async fn tell_status(&self, gid: &str) -> Result<EngineStatus> {
        let result = self
            .call("aria2.tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
            .await?;
        let raw: RawStatus = serde_json::from_value(result).context("解析 tellStatus 结果失败")?;
        Ok(raw.into_status())
    }

    /// 等待元数据任务衍生出真实任务，返回衍生 gid 与探测结果
    async fn await_metadata(&self, gid: &str) -> Result<(Gid, MetadataProbe)> {
        let follow = loop {
            let status = self.tell_status(gid).await?;
            if let Some(follow) = status.followed_by.first() {
                break follow.clone();
            }
            if status.failed() || status.state == EngineState::Removed {
                anyhow::bail!(
                    "元数据下载失败: code={:?}, {:?}",
                    status.error_code,
                    status.error_message
                );
            }
            tokio::time::sleep(PROBE_POLL_INTERVAL).await;
        };

        let status = self.tell_status(&follow).await?;
        let probe = MetadataProbe {
            name: status.name,
            total_length: Some(status.total_length).filter(|&l| l > 0),
            declared_file_count: None,
            files: status.files,
        };
        Ok((follow, probe))
    }

    /// 子进程已退出时返回退出状态
    async fn exited(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(exit) => exit,
            Err(e) => {
                debug!("查询 aria2c 进程状态失败: {}", e);
                None
            }
        }
    }

    /// 进程已退出时的失败状态
    fn crashed_status(exit: std::process::ExitStatus) -> EngineStatus {
        EngineStatus {
            state: EngineState::Error,
            total_length: 0,
            completed_length: 0,
            download_speed: 0,
            connections: 0,
            bitfield: None,
            piece_length: 0,
            files: Vec::new(),
            error_code: Some(
                exit.code()
                    .map(|c| format!("exit:{}", c))
                    .unwrap_or_else(|| "exit:signal".to_string()),
            ),
            error_message: Some(format!("aria2c 进程已退出: {}", exit)),
            followed_by: Vec::new(),
            name: None,
            metadata_phase: false,
            estimated: false,
        }
    }

    /// RPC 失败时用控制台进度兜底
    fn console_fallback(&self, gid: &str) -> Option<EngineStatus> {
        let progress = self.console.lock().clone()?;
        if !gid.starts_with(&progress.gid_prefix) {
            return None;
        }
        Some(EngineStatus {
            state: EngineState::Active,
            total_length: progress.total.unwrap_or(0),
            completed_length: progress.completed,
            download_speed: progress.download_speed,
            connections: progress.connections,
            bitfield: None,
            piece_length: 0,
            files: Vec::new(),
            error_code: None,
            error_message: None,
            followed_by: Vec::new(),
            name: None,
            metadata_phase: false,
            estimated: true,
        })
    }

    fn start_options(request: &StartRequest) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert(
            "dir".to_string(),
            json!(request.dir.to_string_lossy().to_string()),
        );
        if !request.trackers.is_empty() {
            options.insert("bt-tracker".to_string(), json!(request.trackers.join(",")));
        }
        if let Some(files) = &request.select_files {
            let list = files
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            options.insert("select-file".to_string(), json!(list));
            options.insert("bt-remove-unselected-file".to_string(), json!("true"));
        }
        for (key, value) in &request.tuning {
            options.insert(key.clone(), json!(value));
        }
        options
    }
}

#[async_trait]
impl DownloadEngine for Aria2Engine {
    async fn start(&self, request: StartRequest) -> Result<Gid> {
        let options = Self::start_options(&request);
        let result = self
            .call(
                "aria2.addUri",
                vec![json!([request.source]), Value::Object(options)],
            )
            .await?;
        let gid = result
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("addUri 未返回 gid"))?
            .to_string();
        // 磁力链接会先下载元数据再衍生出真实任务（followedBy），由监督器跟随切换
        info!("下载已提交: gid={}, select={:?}", gid, request.select_files);
        Ok(gid)
    }

    async fn status(&self, gid: &str) -> Result<EngineStatus> {
        if let Some(exit) = self.exited().await {
            warn!("aria2c 进程已退出: {}", exit);
            return Ok(Self::crashed_status(exit));
        }
        match self.tell_status(gid).await {
            Ok(status) => Ok(status),
            Err(e) => match self.console_fallback(gid) {
                Some(status) => {
                    warn!("RPC 状态查询失败，使用控制台进度: gid={}, {}", gid, e);
                    Ok(status)
                }
                None => Err(e),
            },
        }
    }

    async fn pause(&self, gid: &str) -> Result<()> {
        self.call("aria2.forcePause", vec![json!(gid)]).await?;
        info!("下载已暂停: gid={}", gid);
        Ok(())
    }

    async fn unpause(&self, gid: &str) -> Result<()> {
        self.call("aria2.unpause", vec![json!(gid)]).await?;
        info!("下载已恢复: gid={}", gid);
        Ok(())
    }

    async fn remove(&self, gid: &str) -> Result<()> {
        // 已停止的任务不能再 forceRemove，只需清理结果记录
        let removed = self.call("aria2.forceRemove", vec![json!(gid)]).await;
        if let Err(e) = &removed {
            debug!("forceRemove 失败（任务可能已停止）: gid={}, {}", gid, e);
        }
        if let Err(e) = self.call("aria2.removeDownloadResult", vec![json!(gid)]).await {
            debug!("清理下载结果失败: gid={}, {}", gid, e);
            removed?;
        }
        info!("下载已移除: gid={}", gid);
        Ok(())
    }

    async fn probe_metadata(
        &self,
        source: &str,
        trackers: &[String],
        timeout: Duration,
    ) -> Result<MetadataProbe> {
        let mut options = Map::new();
        options.insert("pause-metadata".to_string(), json!("true"));
        if !trackers.is_empty() {
            options.insert("bt-tracker".to_string(), json!(trackers.join(",")));
        }

        let result = self
            .call("aria2.addUri", vec![json!([source]), Value::Object(options)])
            .await?;
        let gid = result
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("addUri 未返回 gid"))?
            .to_string();
        info!("开始探测元数据: gid={}", gid);

        let outcome = tokio::time::timeout(timeout, self.await_metadata(&gid)).await;

        // 仅探测，不保留任务；否则正式下载同一 info hash 时会被拒绝
        let mut leftovers = match &outcome {
            Ok(Ok((follow, _))) => vec![follow.clone()],
            _ => match self.tell_status(&gid).await {
                Ok(status) => status.followed_by,
                Err(_) => Vec::new(),
            },
        };
        leftovers.push(gid);
        for id in &leftovers {
            if let Err(e) = self.remove(id).await {
                debug!("移除探测任务失败: gid={}, {}", id, e);
            }
        }

        match outcome {
            Ok(result) => result.map(|(_, probe)| probe),
            Err(_) => anyhow::bail!("元数据探测超时 ({:?})", timeout),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.call("aria2.forceShutdown", vec![]).await {
            debug!("aria2 forceShutdown 失败: {}", e);
        }
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(exit)) => info!("aria2c 已退出: {}", exit),
                _ => {
                    warn!("aria2c 未能正常退出，强制终止");
                    child.kill().await.context("终止 aria2c 失败")?;
                }
            }
        }
        Ok(())
    }
}
