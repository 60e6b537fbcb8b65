// 分段上传引擎
//
// - 文件 <= 小文件阈值：整体直传
// - 否则：创建上传会话，按固定块大小串行上传所有分段
//
// 任何分段失败都是本次运行的致命错误，不做自动重试；
// 错误带上文件名和字节范围，便于定位。

use crate::error::{PipelineError, PipelineResult};
use crate::storage::{ObjectStorage, RangeOutcome, RemoteItem, UploadSession};
use crate::task::UploadedFileRecord;
use crate::uploader::chunk::{plan_chunks, read_range, UploadCursor};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 分段上传器
pub struct ChunkedUploader {
    storage: Arc<dyn ObjectStorage>,
    chunk_size: u64,
    small_object_threshold: u64,
    /// 本次运行累计上传字节数（用于进度）
    uploaded: AtomicU64,
}

impl ChunkedUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, chunk_size: u64, small_object_threshold: u64) -> Self {
        Self {
            storage,
            chunk_size,
            small_object_threshold,
            uploaded: AtomicU64::new(0),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// 上传一个已下载完成的本地文件
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        file_name: &str,
    ) -> PipelineResult<UploadedFileRecord> {
        let size = tokio::fs::metadata(local_path).await?.len();
        info!(
            "开始上传: file={}, size={}, remote={}",
            file_name, size, remote_path
        );

        let item = if size <= self.small_object_threshold {
            let data = read_range(local_path, &(0..size))
                .await
                .map_err(|e| chunk_error(file_name, 0..size, e))?;
            let item = self.storage.put_small(remote_path, data).await?;
            self.uploaded.fetch_add(size, Ordering::Relaxed);
            item
        } else {
            let session = self.storage.create_upload_session(remote_path).await?;
            let mut cursor = UploadCursor::new(session, size);
            let mut completed = None;
            for range in plan_chunks(0, size, self.chunk_size) {
                completed = self.send(&mut cursor, local_path, file_name, range).await?;
            }
            completed.ok_or_else(|| {
                chunk_error(
                    file_name,
                    0..size,
                    anyhow::anyhow!("所有分段已发送，但网盘未返回文件信息"),
                )
            })?
        };

        info!("上传完成: file={}, id={}, path={}", file_name, item.id, item.path);
        Ok(UploadedFileRecord {
            file_name: file_name.to_string(),
            file_size: size,
            remote_item_id: item.id,
            remote_path: item.path,
        })
    }

    /// 创建上传会话并返回对应的游标
    pub async fn open(&self, remote_path: &str, total: u64) -> PipelineResult<UploadCursor> {
        let session = self.storage.create_upload_session(remote_path).await?;
        Ok(UploadCursor::new(session, total))
    }

    /// 发送一个分段并推进游标；最后一个分段返回网盘文件信息
    pub async fn send(
        &self,
        cursor: &mut UploadCursor,
        local_path: &Path,
        file_name: &str,
        range: Range<u64>,
    ) -> PipelineResult<Option<RemoteItem>> {
        if range.start != cursor.committed() {
            return Err(chunk_error(
                file_name,
                range.clone(),
                anyhow::anyhow!("分段起点 {} 与已提交位置 {} 不一致", range.start, cursor.committed()),
            ));
        }

        let data = read_range(local_path, &range)
            .await
            .map_err(|e| chunk_error(file_name, range.clone(), e))?;
        let len = data.len() as u64;

        let session: &UploadSession = cursor.session();
        let outcome = self
            .storage
            .upload_range(session, range.clone(), cursor.total(), data)
            .await
            .map_err(|e| chunk_error(file_name, range.clone(), e.into()))?;

        cursor
            .commit(&range)
            .map_err(|e| chunk_error(file_name, range.clone(), e))?;
        self.uploaded.fetch_add(len, Ordering::Relaxed);

        match outcome {
            RangeOutcome::Accepted { next_expected } => {
                debug!(
                    "分段已接收: file={}, bytes={}-{}, next={}",
                    file_name,
                    range.start,
                    range.end - 1,
                    next_expected
                );
                if next_expected != cursor.committed() {
                    return Err(chunk_error(
                        file_name,
                        range,
                        anyhow::anyhow!(
                            "网盘期望的下一个偏移 {} 与本地 {} 不一致",
                            next_expected,
                            cursor.committed()
                        ),
                    ));
                }
                Ok(None)
            }
            RangeOutcome::Completed(item) => {
                if !cursor.is_finished() {
                    return Err(chunk_error(
                        file_name,
                        range,
                        anyhow::anyhow!("网盘提前结束了上传会话"),
                    ));
                }
                Ok(Some(item))
            }
        }
    }
}

fn chunk_error(file: &str, range: Range<u64>, source: anyhow::Error) -> PipelineError {
    PipelineError::UploadChunkFailed {
        file: file.to_string(),
        range,
        source,
    }
}
