use magnet_relay::{
    callback::{CallbackClient, CompletionRecord},
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    engine::{Aria2Engine, DownloadEngine},
    logging,
    metadata::display_name,
    pipeline::Pipeline,
    storage::GraphStorage,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 配置文件路径：命令行第一个参数 > RELAY_CONFIG > 默认路径
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAY_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let path = config_path();
    let config = match AppConfig::load(&path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败 {}: {:#}", path, e);
            return ExitCode::FAILURE;
        }
    };

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);
    info!("magnet-relay v{} 启动中...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("配置校验失败: {}", e);
        return ExitCode::FAILURE;
    }

    let task = config.task.to_task();
    info!(
        "任务: id={}, 目标={}, 预算={:?}, 停滞阈值={:?}",
        task.id, task.dest_prefix, task.time_budget, task.stall_timeout
    );

    let callback = match CallbackClient::new(&config.callback, &task.id) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("创建回调客户端失败: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let engine = match Aria2Engine::spawn(&config.engine).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("启动下载引擎失败: {:#}", e);
            let record = CompletionRecord::failed(&task.id, &display_name(&task.magnet), format!("{:#}", e));
            report_completion(&callback, &record).await;
            return ExitCode::FAILURE;
        }
    };

    let result = match GraphStorage::new(&config.storage) {
        Ok(storage) => {
            let download_dir = config.engine.download_dir.join(&task.id);
            let pipeline = Pipeline::new(
                task.clone(),
                config.pipeline.clone(),
                engine.clone(),
                Arc::new(storage),
                callback.clone(),
                download_dir,
            )
            .with_metadata_timeout(Duration::from_secs(config.engine.metadata_timeout_secs));

            tokio::select! {
                result = pipeline.run() => result.map_err(|e| format!("{} ({})", e, e.kind())),
                _ = tokio::signal::ctrl_c() => {
                    warn!("收到中断信号，终止任务");
                    Err("interrupted".to_string())
                }
            }
        }
        Err(e) => Err(format!("创建存储客户端失败: {:#}", e)),
    };

    let code = match result {
        Ok(outcome) => {
            info!(
                "任务完成: name={}, mode={}, 文件数={}",
                outcome.metadata.name,
                outcome.mode,
                outcome.files.len()
            );
            let record = CompletionRecord::completed(&task.id, &outcome.metadata.name, outcome.files);
            report_completion(&callback, &record).await;
            ExitCode::SUCCESS
        }
        Err(message) => {
            error!("任务失败: {}", message);
            let record = CompletionRecord::failed(&task.id, &display_name(&task.magnet), message);
            report_completion(&callback, &record).await;
            ExitCode::FAILURE
        }
    };

    if let Err(e) = engine.shutdown().await {
        warn!("关闭下载引擎失败: {:#}", e);
    }
    info!("magnet-relay 已退出");
    code
}

async fn report_completion(callback: &CallbackClient, record: &CompletionRecord) {
    if let Err(e) = callback.post_completion(record).await {
        warn!("完成回调发送失败: {:#}", e);
    }
}
