// Sequential 模式：多文件逐个 下载 -> 上传 -> 删除
//
// 每个文件一个下载周期，引擎只选中该文件；本地同时最多存在一个文件。
// 周期预算按剩余字节比例分配剩余时间，但不少于停滞阈值（且不超过剩余时间）。

use super::bulk::{upload_tree, BulkStrategy};
use super::{drive_cycle, remaining, CycleStrategy, PipelineContext};
use crate::engine::EngineStatus;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::remote_path;
use crate::supervisor::DownloadSupervisor;
use crate::task::{FileEntry, Phase, TorrentMetadata, UploadedFileRecord};
use crate::uploader::FolderScanner;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 逐个处理文件列表
pub async fn run(
    ctx: &PipelineContext,
    metadata: &TorrentMetadata,
    deadline: Instant,
) -> PipelineResult<Vec<UploadedFileRecord>> {
    if metadata.files.is_empty() {
        // 只有汇总计数没有文件列表时无法按文件选择，整体处理一次
        warn!("缺少文件列表，按整体下载处理");
        let mut strategy = BulkStrategy::new(metadata);
        let budget = remaining(ctx, deadline)?;
        let records = drive_cycle(ctx, &mut strategy, ctx.start_request(None), budget).await?;
        clear_dir(&ctx.download_dir).await?;
        return Ok(records);
    }

    let mut remaining_bytes: u64 = metadata.files.iter().map(|f| f.size).sum();
    let mut records = Vec::with_capacity(metadata.files.len());

    for (n, entry) in metadata.files.iter().enumerate() {
        let left = remaining(ctx, deadline)?;
        let budget = allocate_budget(left, entry.size, remaining_bytes, ctx.task.stall_timeout);
        info!(
            "顺序模式 [{}/{}]: file={}, size={}, 预算 {:?}",
            n + 1,
            metadata.files.len(),
            entry.relative_path,
            entry.size,
            budget
        );

        let mut strategy = FileStrategy {
            name: metadata.name.clone(),
            entry: entry.clone(),
        };
        let request = ctx.start_request(Some(vec![entry.index]));
        let cycle = drive_cycle(ctx, &mut strategy, request, budget).await;

        // 无论成败都删除本地副本
        clear_dir(&ctx.download_dir).await?;
        records.extend(cycle?);
        remaining_bytes = remaining_bytes.saturating_sub(entry.size);
    }

    Ok(records)
}

/// 按剩余字节比例分配时间预算
///
/// 结果不少于 `floor`（但不超过 `left`）
pub fn allocate_budget(left: Duration, size: u64, remaining_bytes: u64, floor: Duration) -> Duration {
    let share = if remaining_bytes == 0 {
        left
    } else {
        let ratio = size.min(remaining_bytes) as f64 / remaining_bytes as f64;
        left.mul_f64(ratio)
    };
    share.max(floor).min(left)
}

/// 删除目录下的全部内容（保留目录本身）
async fn clear_dir(dir: &Path) -> PipelineResult<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        debug!("已删除本地副本: {}", path.display());
    }
    Ok(())
}

/// 单文件周期
struct FileStrategy {
    name: String,
    entry: FileEntry,
}

impl FileStrategy {
    /// 在下载目录中定位该文件
    fn locate(&self, dir: &Path) -> PipelineResult<PathBuf> {
        let expected = dir.join(&self.entry.relative_path);
        if expected.is_file() {
            return Ok(expected);
        }
        let files = FolderScanner::new()
            .scan(dir)
            .map_err(|e| PipelineError::NoFilesProduced(format!("{:#}", e)))?;
        files
            .into_iter()
            .find(|f| {
                f.relative_path.ends_with(&self.entry.relative_path)
                    || self.entry.relative_path.ends_with(&f.relative_path)
            })
            .map(|f| f.local_path)
            .ok_or_else(|| {
                PipelineError::NoFilesProduced(format!(
                    "{} 不在 {}",
                    self.entry.relative_path,
                    dir.display()
                ))
            })
    }
}

#[async_trait]
impl CycleStrategy for FileStrategy {
    fn phase(&self) -> Phase {
        Phase::Downloading
    }

    fn label(&self) -> Option<String> {
        Some(self.entry.relative_path.clone())
    }

    async fn on_tick(
        &mut self,
        _ctx: &PipelineContext,
        _supervisor: &DownloadSupervisor,
    ) -> PipelineResult<()> {
        Ok(())
    }

    async fn on_download_complete(
        &mut self,
        ctx: &PipelineContext,
        status: &EngineStatus,
    ) -> PipelineResult<Vec<UploadedFileRecord>> {
        let name = status.name.as_deref().unwrap_or(&self.name);
        let local = match self.locate(&ctx.download_dir) {
            Ok(local) => local,
            Err(e) => {
                // 引擎的文件布局与元数据不一致时退回整体上传
                warn!("{}，上传下载目录中的全部文件", e);
                return upload_tree(ctx, name).await;
            }
        };
        let file_name = self
            .entry
            .relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.entry.relative_path)
            .to_string();
        let remote = remote_path(&ctx.task.dest_prefix, name, &self.entry.relative_path);
        let record = ctx.uploader.upload_file(&local, &remote, &file_name).await?;
        Ok(vec![record])
    }

    async fn on_failure(&mut self, _ctx: &PipelineContext, error: &PipelineError) {
        warn!("文件周期失败: file={}, {}", self.entry.relative_path, error);
    }
}
