//! 传输流水线
//!
//! 元数据解析 -> 模式选择 -> 一个或多个“下载周期”。
//!
//! 三种模式共用同一个周期驱动器 [`drive_cycle`]：启动引擎下载、交给监督器看护，
//! 每个轮询间隔调用一次策略的 `on_tick`，下载完成后调用 `on_download_complete`，
//! 任何致命错误都先取消本周期全部后台任务，再调用 `on_failure` 并上抛。

pub mod bulk;
pub mod sequential;
pub mod streaming;

use crate::backpressure::{FreeSpaceProbe, SystemFreeSpace};
use crate::config::PipelineConfig;
use crate::engine::{DownloadEngine, EngineStatus, StartRequest};
use crate::error::{PipelineError, PipelineResult};
use crate::metadata::MetadataResolver;
use crate::mode::{select_mode, PipelineMode};
use crate::progress::{ProgressReporter, ProgressSink};
use crate::storage::ObjectStorage;
use crate::supervisor::{DownloadSupervisor, RunScope, SupervisorConfig, Terminal};
use crate::task::{Phase, ProgressSnapshot, TorrentMetadata, TransferTask, UploadedFileRecord};
use crate::uploader::ChunkedUploader;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

pub use bulk::BulkStrategy;
pub use streaming::StreamingStrategy;

/// 一次运行共享的组件与参数
pub struct PipelineContext {
    pub task: TransferTask,
    pub settings: PipelineConfig,
    pub engine: Arc<dyn DownloadEngine>,
    pub uploader: ChunkedUploader,
    pub reporter: ProgressReporter,
    pub free_space: Arc<dyn FreeSpaceProbe>,
    /// 本次运行独占的下载目录
    pub download_dir: PathBuf,
    pub metadata_timeout: Duration,
    /// 传给引擎的调优参数
    pub tuning: Vec<(String, String)>,
    scope: RunScope,
}

impl PipelineContext {
    /// 下载全部文件的启动请求
    pub fn start_request(&self, select_files: Option<Vec<usize>>) -> StartRequest {
        StartRequest {
            source: self.task.magnet.clone(),
            dir: self.download_dir.clone(),
            trackers: self.task.trackers.clone(),
            select_files,
            tuning: self.tuning.clone(),
        }
    }

    /// 运行级作用域
    pub fn scope(&self) -> &RunScope {
        &self.scope
    }
}

/// 单个下载周期的策略
#[async_trait]
pub trait CycleStrategy: Send {
    /// 上报进度时使用的阶段
    fn phase(&self) -> Phase;

    /// 进度附加说明（如当前文件名）
    fn label(&self) -> Option<String> {
        None
    }

    /// 下载进行中，每个轮询间隔调用一次
    async fn on_tick(
        &mut self,
        ctx: &PipelineContext,
        supervisor: &DownloadSupervisor,
    ) -> PipelineResult<()>;

    /// 下载完成
    async fn on_download_complete(
        &mut self,
        ctx: &PipelineContext,
        status: &EngineStatus,
    ) -> PipelineResult<Vec<UploadedFileRecord>>;

    /// 周期失败（后台任务已全部停止）
    async fn on_failure(&mut self, ctx: &PipelineContext, error: &PipelineError);
}

/// 驱动一个下载周期
pub async fn drive_cycle<S: CycleStrategy>(
    ctx: &PipelineContext,
    strategy: &mut S,
    request: StartRequest,
    budget: Duration,
) -> PipelineResult<Vec<UploadedFileRecord>> {
    let gid = ctx.engine.start(request).await.map_err(PipelineError::Engine)?;
    let supervisor = DownloadSupervisor::launch(
        ctx.engine.clone(),
        gid,
        SupervisorConfig {
            poll_interval: ctx.settings.poll_interval(),
            liveness_interval: ctx.settings.liveness_interval(),
            stall_timeout: ctx.task.stall_timeout,
            budget,
        },
        &ctx.scope,
    );

    let mut ticker = tokio::time::interval(ctx.settings.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = supervisor.scope().cancelled() => break,
            _ = ticker.tick() => {}
        }

        // 下载完成不打断正在进行的上传；失败则立即打断
        let tick = tokio::select! {
            result = strategy.on_tick(ctx, &supervisor) => result,
            _ = supervisor.scope().failed() => break,
        };
        if let Err(e) = tick {
            error!("周期中止: {}", e);
            supervisor.abort(e.kind()).await;
            strategy.on_failure(ctx, &e).await;
            return Err(e);
        }

        let snapshot = snapshot_of(ctx, strategy, &supervisor);
        ctx.reporter.report(&snapshot).await;
    }

    let outcome = match supervisor.finish().await {
        Ok(status) => {
            ctx.reporter
                .report(&ProgressSnapshot {
                    phase: Phase::Uploading,
                    ..snapshot_of(ctx, strategy, &supervisor)
                })
                .await;
            strategy.on_download_complete(ctx, &status).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = &outcome {
        strategy.on_failure(ctx, e).await;
    }
    outcome
}

fn snapshot_of<S: CycleStrategy>(
    ctx: &PipelineContext,
    strategy: &S,
    supervisor: &DownloadSupervisor,
) -> ProgressSnapshot {
    let state = supervisor.snapshot();
    ProgressSnapshot {
        phase: strategy.phase(),
        downloaded: state.completed_bytes,
        total: state.total_bytes,
        uploaded: ctx.uploader.uploaded_bytes(),
        speed: state.download_speed,
        message: strategy.label(),
    }
}

/// 流水线结果
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub metadata: TorrentMetadata,
    pub mode: PipelineMode,
    pub files: Vec<UploadedFileRecord>,
}

/// 传输流水线
pub struct Pipeline {
    ctx: PipelineContext,
}

impl Pipeline {
    pub fn new(
        task: TransferTask,
        settings: PipelineConfig,
        engine: Arc<dyn DownloadEngine>,
        storage: Arc<dyn ObjectStorage>,
        sink: Arc<dyn ProgressSink>,
        download_dir: PathBuf,
    ) -> Self {
        let uploader =
            ChunkedUploader::new(storage, settings.chunk_size, settings.small_object_threshold);
        let reporter = ProgressReporter::new(sink, settings.progress_interval());
        Self {
            ctx: PipelineContext {
                task,
                settings,
                engine,
                uploader,
                reporter,
                free_space: Arc::new(SystemFreeSpace),
                download_dir,
                metadata_timeout: Duration::from_secs(180),
                tuning: Vec::new(),
                scope: RunScope::new(),
            },
        }
    }

    pub fn with_free_space(mut self, probe: Arc<dyn FreeSpaceProbe>) -> Self {
        self.ctx.free_space = probe;
        self
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.ctx.metadata_timeout = timeout;
        self
    }

    pub fn with_tuning(mut self, tuning: Vec<(String, String)>) -> Self {
        self.ctx.tuning = tuning;
        self
    }

    /// 运行到结束
    pub async fn run(&self) -> PipelineResult<PipelineOutcome> {
        let result = self.run_inner().await;
        let reason = match &result {
            Ok(_) => "finished",
            Err(e) => e.kind(),
        };
        self.ctx.scope.terminate(Terminal::Aborted(reason.to_string()));
        self.ctx.scope.join_all().await;
        result
    }

    async fn run_inner(&self) -> PipelineResult<PipelineOutcome> {
        let ctx = &self.ctx;
        let started = Instant::now();
        let deadline = started + ctx.task.time_budget;
        tokio::fs::create_dir_all(&ctx.download_dir).await?;

        ctx.reporter
            .report(&ProgressSnapshot {
                phase: Phase::Metadata,
                downloaded: 0,
                total: 0,
                uploaded: 0,
                speed: 0,
                message: None,
            })
            .await;

        let threshold = ctx.settings.mode_threshold;
        let metadata = MetadataResolver::new(
            ctx.engine.as_ref(),
            ctx.metadata_timeout,
            threshold.saturating_add(1),
        )
        .resolve(&ctx.task)
        .await;

        let mode = select_mode(metadata.total_size, metadata.file_count, threshold);
        info!(
            "传输模式: {} (size={}, files={}, placeholder={})",
            mode, metadata.total_size, metadata.file_count, metadata.placeholder
        );

        let files = match mode {
            PipelineMode::Bulk => {
                let mut strategy = BulkStrategy::new(&metadata);
                let budget = remaining(ctx, deadline)?;
                drive_cycle(ctx, &mut strategy, ctx.start_request(None), budget).await?
            }
            PipelineMode::Streaming => {
                let mut strategy = StreamingStrategy::prepare(ctx, &metadata).await?;
                let budget = remaining(ctx, deadline)?;
                drive_cycle(ctx, &mut strategy, ctx.start_request(None), budget).await?
            }
            PipelineMode::Sequential => sequential::run(ctx, &metadata, deadline).await?,
        };

        if files.is_empty() {
            return Err(PipelineError::NoFilesProduced(
                ctx.download_dir.display().to_string(),
            ));
        }

        let total: u64 = files.iter().map(|f| f.file_size).sum();
        ctx.reporter
            .finish(&ProgressSnapshot {
                phase: Phase::Completed,
                downloaded: total,
                total,
                uploaded: ctx.uploader.uploaded_bytes(),
                speed: 0,
                message: None,
            })
            .await;
        info!(
            "流水线完成: {} 个文件, 耗时 {:?}",
            files.len(),
            started.elapsed()
        );

        Ok(PipelineOutcome {
            metadata,
            mode,
            files,
        })
    }
}

/// 距离运行截止时间的剩余预算
pub(crate) fn remaining(ctx: &PipelineContext, deadline: Instant) -> PipelineResult<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(PipelineError::DownloadTimedOut {
            budget: ctx.task.time_budget,
        });
    }
    Ok(left)
}
