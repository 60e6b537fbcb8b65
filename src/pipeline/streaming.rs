// Streaming 模式：单个大文件边下边传
//
// 下载开始前先打开一个长期有效的上传会话；之后每个轮询间隔：
// 1. 按磁盘剩余空间暂停/恢复下载
// 2. 用最新的分片位图推进可上传前缀
// 3. 上传前缀内所有新出现的整块（游标只按整块前进）
// 下载完成后再把剩余部分（可能不足一整块）全部发出。
//
// 元数据是占位值时，等引擎报告真实文件布局后再打开会话；
// 真实布局是多文件或大小不符时退化为下载完成后整体上传。
// 磁力任务的元数据阶段不算真实布局。

use super::bulk::upload_tree;
use super::{CycleStrategy, PipelineContext};
use crate::backpressure::DiskBackpressure;
use crate::engine::EngineStatus;
use crate::error::{PipelineError, PipelineResult};
use crate::gate::{PieceBitmap, PieceGate};
use crate::storage::{remote_path, RemoteItem};
use crate::supervisor::DownloadSupervisor;
use crate::task::{Phase, TorrentMetadata, UploadedFileRecord};
use crate::uploader::{punch_hole, UploadCursor};
use async_trait::async_trait;
use std::ops::Range;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// 正在边下边传的目标文件
struct StreamTarget {
    local_path: PathBuf,
    file_name: String,
    cursor: UploadCursor,
    gate: PieceGate,
    /// 已打洞回收的前缀
    reclaimed: u64,
    completed: Option<RemoteItem>,
}

pub struct StreamingStrategy {
    name: String,
    target: Option<StreamTarget>,
    degraded: bool,
    backpressure: DiskBackpressure,
}

impl StreamingStrategy {
    /// 在下载开始前准备：元数据可信时立即打开上传会话
    pub async fn prepare(ctx: &PipelineContext, metadata: &TorrentMetadata) -> PipelineResult<Self> {
        let backpressure = DiskBackpressure::new(
            ctx.free_space.clone(),
            ctx.download_dir.clone(),
            ctx.settings.low_watermark,
            ctx.settings.high_watermark,
        );
        let mut strategy = Self {
            name: metadata.name.clone(),
            target: None,
            degraded: false,
            backpressure,
        };

        if !metadata.placeholder {
            let relative = metadata
                .files
                .first()
                .map(|f| f.relative_path.clone())
                .unwrap_or_else(|| metadata.name.clone());
            strategy.target = Some(strategy.open(ctx, &relative, metadata.total_size).await?);
        }
        Ok(strategy)
    }

    async fn open(
        &self,
        ctx: &PipelineContext,
        relative: &str,
        total: u64,
    ) -> PipelineResult<StreamTarget> {
        let remote = remote_path(&ctx.task.dest_prefix, &self.name, relative);
        let cursor = ctx.uploader.open(&remote, total).await?;
        let file_name = relative.rsplit('/').next().unwrap_or(relative).to_string();
        info!(
            "边下边传目标: file={}, size={}, remote={}",
            file_name, total, remote
        );
        Ok(StreamTarget {
            local_path: ctx.download_dir.join(relative),
            file_name,
            cursor,
            gate: PieceGate::new(0, total),
            reclaimed: 0,
            completed: None,
        })
    }

    /// 放弃分段上传，改为下载完成后整体上传
    fn degrade(&mut self, reason: &str) -> PipelineResult<()> {
        if self.degraded {
            return Ok(());
        }
        if let Some(target) = &self.target {
            if target.reclaimed > 0 {
                return Err(PipelineError::Engine(anyhow::anyhow!(
                    "{}，且本地前 {} 字节已回收，无法整体上传",
                    reason,
                    target.reclaimed
                )));
            }
        }
        warn!("{}，改为下载完成后整体上传", reason);
        self.degraded = true;
        self.target = None;
        Ok(())
    }

    /// 校验引擎报告的真实布局，必要时打开会话；返回是否可以继续分段上传
    async fn reconcile(&mut self, ctx: &PipelineContext, status: &EngineStatus) -> PipelineResult<bool> {
        if self.degraded {
            return Ok(false);
        }
        // 元数据阶段和控制台估算值都不反映真实布局，既不校验也不推进
        if !status.describes_content() {
            return Ok(false);
        }
        if status.files.len() > 1 {
            self.degrade("引擎报告为多文件种子")?;
            return Ok(false);
        }
        if let Some(name) = &status.name {
            if self.target.is_none() {
                self.name = name.clone();
            }
        }

        match &self.target {
            None => {
                let Some(file) = status.files.first() else {
                    return Ok(false);
                };
                if status.total_length == 0 {
                    return Ok(false);
                }
                let relative = file.relative_path.clone();
                self.target = Some(self.open(ctx, &relative, status.total_length).await?);
            }
            Some(target) => {
                if status.total_length > 0 && status.total_length != target.cursor.total() {
                    let reason = format!(
                        "实际大小 {} 与元数据 {} 不一致",
                        status.total_length,
                        target.cursor.total()
                    );
                    self.degrade(&reason)?;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn send(
        ctx: &PipelineContext,
        target: &mut StreamTarget,
        range: Range<u64>,
    ) -> PipelineResult<()> {
        let item = ctx
            .uploader
            .send(&mut target.cursor, &target.local_path, &target.file_name, range.clone())
            .await?;
        if item.is_some() {
            target.completed = item;
        }
        if ctx.settings.punch_holes {
            match punch_hole(&target.local_path, &range) {
                Ok(()) => target.reclaimed = range.end,
                Err(e) => debug!("打洞失败（已忽略）: {}", e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CycleStrategy for StreamingStrategy {
    fn phase(&self) -> Phase {
        Phase::Streaming
    }

    fn label(&self) -> Option<String> {
        self.target.as_ref().map(|t| {
            format!(
                "{} 已上传 {}/{}",
                t.file_name,
                t.cursor.committed(),
                t.cursor.total()
            )
        })
    }

    async fn on_tick(
        &mut self,
        ctx: &PipelineContext,
        supervisor: &DownloadSupervisor,
    ) -> PipelineResult<()> {
        self.backpressure.regulate(supervisor).await;

        let Some(status) = supervisor.snapshot().latest else {
            return Ok(());
        };
        if !self.reconcile(ctx, &status).await? {
            return Ok(());
        }
        let Some(target) = self.target.as_mut() else {
            return Ok(());
        };

        target.gate.set_piece_length(status.piece_length);
        let Some(hex) = status.bitfield.as_deref() else {
            return Ok(());
        };
        let bitmap = match PieceBitmap::from_hex(hex) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                debug!("忽略无法解析的分片位图: {:#}", e);
                return Ok(());
            }
        };
        let authorized = target.gate.advance(&bitmap);

        let chunk_size = ctx.uploader.chunk_size();
        while let Some(range) = target.cursor.next_whole_chunk(authorized, chunk_size) {
            Self::send(ctx, target, range).await?;
        }
        Ok(())
    }

    async fn on_download_complete(
        &mut self,
        ctx: &PipelineContext,
        status: &EngineStatus,
    ) -> PipelineResult<Vec<UploadedFileRecord>> {
        // 下载在两次轮询之间完成时，这里补做一次布局校验
        if !self.degraded {
            self.reconcile(ctx, status).await?;
        }
        let target = match self.target.as_mut() {
            Some(target) if !self.degraded => target,
            _ => {
                let name = status.name.clone().unwrap_or_else(|| self.name.clone());
                return upload_tree(ctx, &name).await;
            }
        };

        let total = target.gate.complete();
        info!(
            "下载完成，发送剩余数据: file={}, {}/{}",
            target.file_name,
            target.cursor.committed(),
            total
        );
        let chunk_size = ctx.uploader.chunk_size();
        while let Some(range) = target.cursor.tail(total, chunk_size) {
            Self::send(ctx, target, range).await?;
        }

        let item = target.completed.take().ok_or_else(|| PipelineError::UploadChunkFailed {
            file: target.file_name.clone(),
            range: 0..total,
            source: anyhow::anyhow!("上传会话结束但未返回文件信息"),
        })?;
        Ok(vec![UploadedFileRecord {
            file_name: target.file_name.clone(),
            file_size: total,
            remote_item_id: item.id,
            remote_path: item.path,
        }])
    }

    async fn on_failure(&mut self, _ctx: &PipelineContext, error: &PipelineError) {
        match &self.target {
            Some(target) => warn!(
                "边下边传失败: file={}, 已提交 {}/{} 字节, {}",
                target.file_name,
                target.cursor.committed(),
                target.cursor.total(),
                error
            ),
            None => warn!("边下边传失败: {}", error),
        }
    }
}
