// Bulk 模式：先完整下载，再逐个上传全部产物
//
// 多文件种子递归扫描下载目录，保持相对目录结构。

use super::{CycleStrategy, PipelineContext};
use crate::engine::EngineStatus;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::remote_path;
use crate::supervisor::DownloadSupervisor;
use crate::task::{Phase, ProgressSnapshot, TorrentMetadata, UploadedFileRecord};
use crate::uploader::FolderScanner;
use async_trait::async_trait;
use tracing::{info, warn};

pub struct BulkStrategy {
    name: String,
}

impl BulkStrategy {
    pub fn new(metadata: &TorrentMetadata) -> Self {
        Self {
            name: metadata.name.clone(),
        }
    }
}

#[async_trait]
impl CycleStrategy for BulkStrategy {
    fn phase(&self) -> Phase {
        Phase::Downloading
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
        upload_tree(ctx, name).await
    }

    async fn on_failure(&mut self, _ctx: &PipelineContext, error: &PipelineError) {
        warn!("Bulk 下载失败: {}", error);
    }
}

/// 上传下载目录下的全部文件
pub(crate) async fn upload_tree(
    ctx: &PipelineContext,
    name: &str,
) -> PipelineResult<Vec<UploadedFileRecord>> {
    let files = FolderScanner::new()
        .scan(&ctx.download_dir)
        .map_err(|e| PipelineError::NoFilesProduced(format!("{:#}", e)))?;
    if files.is_empty() {
        return Err(PipelineError::NoFilesProduced(
            ctx.download_dir.display().to_string(),
        ));
    }

    let total: u64 = files.iter().map(|f| f.size).sum();
    info!("开始上传 {} 个文件, 共 {} 字节", files.len(), total);

    let mut records = Vec::with_capacity(files.len());
    for file in &files {
        let remote = remote_path(&ctx.task.dest_prefix, name, &file.relative_path);
        let record = ctx
            .uploader
            .upload_file(&file.local_path, &remote, file.file_name())
            .await?;
        records.push(record);

        ctx.reporter
            .report(&ProgressSnapshot {
                phase: Phase::Uploading,
                downloaded: total,
                total,
                uploaded: ctx.uploader.uploaded_bytes(),
                speed: 0,
                message: Some(file.relative_path.clone()),
            })
            .await;
    }
    Ok(records)
}
