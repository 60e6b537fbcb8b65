// 上传分段与游标
//
// 会话上传要求字节范围严格递增且首尾相接，因此同一文件的分段只能串行发送。
// UploadCursor 记录已提交到网盘的字节数：只增不减，且永远不超过当前已授权（已下载）的前缀。

use crate::storage::UploadSession;
use anyhow::{Context, Result};
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 把 `[start, end)` 切成不超过 `chunk_size` 的连续分段
pub fn plan_chunks(start: u64, end: u64, chunk_size: u64) -> Vec<Range<u64>> {
    let mut chunks = Vec::new();
    if chunk_size == 0 {
        return chunks;
    }
    let mut offset = start;
    while offset < end {
        let next = offset.saturating_add(chunk_size).min(end);
        chunks.push(offset..next);
        offset = next;
    }
    chunks
}

/// 读取本地文件的一个字节范围
pub async fn read_range(path: &Path, range: &Range<u64>) -> Result<Vec<u8>> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("打开上传文件失败: {}", path.display()))?;

    file.seek(std::io::SeekFrom::Start(range.start))
        .await
        .context("文件定位失败")?;

    let len = (range.end - range.start) as usize;
    let mut buffer = vec![0u8; len];
    file.read_exact(&mut buffer)
        .await
        .with_context(|| format!("读取分段数据失败: bytes={}-{}", range.start, range.end))?;

    debug!(
        "读取分段: bytes={}-{}, 大小={} bytes",
        range.start,
        range.end.saturating_sub(1),
        len
    );
    Ok(buffer)
}

/// 上传游标
#[derive(Debug, Clone)]
pub struct UploadCursor {
    session: UploadSession,
    total: u64,
    committed: u64,
}

impl UploadCursor {
    pub fn new(session: UploadSession, total: u64) -> Self {
        Self {
            session,
            total,
            committed: 0,
        }
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_finished(&self) -> bool {
        self.committed >= self.total
    }

    /// 下一个可上传的整块：`[committed, committed + chunk_size)` 必须完全落在授权前缀内
    pub fn next_whole_chunk(&self, authorized: u64, chunk_size: u64) -> Option<Range<u64>> {
        let end = self.committed.checked_add(chunk_size)?;
        if chunk_size == 0 || end > authorized.min(self.total) {
            return None;
        }
        Some(self.committed..end)
    }

    /// 收尾分段：已授权全部数据后剩余的部分（可能不足一个整块）
    pub fn tail(&self, authorized: u64, chunk_size: u64) -> Option<Range<u64>> {
        if authorized < self.total || self.is_finished() {
            return None;
        }
        let end = self.committed.saturating_add(chunk_size).min(self.total);
        Some(self.committed..end)
    }

    /// 提交一个已被网盘接收的分段
    pub fn commit(&mut self, range: &Range<u64>) -> Result<()> {
        if range.start != self.committed || range.end <= range.start || range.end > self.total {
            anyhow::bail!(
                "分段不连续: committed={}, range={}-{}, total={}",
                self.committed,
                range.start,
                range.end,
                self.total
            );
        }
        self.committed = range.end;
        Ok(())
    }
}
