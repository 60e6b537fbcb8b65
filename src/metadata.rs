//! 元数据解析
//!
//! 在决定传输策略之前，先让下载引擎做一次仅元数据的探测，得到总大小、文件数和文件列表。
//! 超时或无法解析时不终止任务，而是回退为保守的占位元数据（足以触发安全处理的大小，文件数 1）。

use crate::engine::{DownloadEngine, MetadataProbe};
use crate::error::{PipelineError, PipelineResult};
use crate::task::{TorrentMetadata, TransferTask};
use std::time::Duration;
use tracing::{info, warn};

/// 探测超时后留给引擎清理探测任务的时间
const PROBE_CLEANUP_GRACE: Duration = Duration::from_secs(10);

/// 元数据解析器
pub struct MetadataResolver<'a> {
    engine: &'a dyn DownloadEngine,
    timeout: Duration,
    /// 占位元数据使用的假定大小
    placeholder_size: u64,
}

impl<'a> MetadataResolver<'a> {
    pub fn new(engine: &'a dyn DownloadEngine, timeout: Duration, placeholder_size: u64) -> Self {
        Self {
            engine,
            timeout,
            placeholder_size,
        }
    }

    /// 解析元数据，失败时回退为占位元数据
    pub async fn resolve(&self, task: &TransferTask) -> TorrentMetadata {
        match self.try_resolve(task).await {
            Ok(metadata) => {
                info!(
                    "元数据解析完成: name={}, size={}, files={}",
                    metadata.name, metadata.total_size, metadata.file_count
                );
                metadata
            }
            Err(e) => {
                warn!("{}，使用占位元数据继续", e);
                self.placeholder(task)
            }
        }
    }

    async fn try_resolve(&self, task: &TransferTask) -> PipelineResult<TorrentMetadata> {
        // 引擎自己负责超时和清理；外层只兜底引擎无响应的情况
        let probe = tokio::time::timeout(
            self.timeout + PROBE_CLEANUP_GRACE,
            self.engine.probe_metadata(&task.magnet, &task.trackers, self.timeout),
        )
        .await
        .map_err(|_| {
            PipelineError::MetadataUnavailable(format!("探测超时 ({:?})", self.timeout))
        })?
        .map_err(|e| PipelineError::MetadataUnavailable(format!("{:#}", e)))?;

        reconcile(probe, display_name(&task.magnet))
    }

    /// 占位元数据
    fn placeholder(&self, task: &TransferTask) -> TorrentMetadata {
        TorrentMetadata {
            name: display_name(&task.magnet),
            total_size: self.placeholder_size,
            file_count: 1,
            files: Vec::new(),
            placeholder: true,
        }
    }
}

/// 合并两路信号：显式文件列表优先于汇总计数
pub fn reconcile(probe: MetadataProbe, fallback_name: String) -> PipelineResult<TorrentMetadata> {
    let name = probe
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(fallback_name);

    if !probe.files.is_empty() {
        let listed = probe.files.len();
        if let Some(declared) = probe.declared_file_count {
            if declared != listed {
                warn!(
                    "文件数不一致: 汇总={}, 列表={}，以文件列表为准",
                    declared, listed
                );
            }
        }
        let summed: u64 = probe.files.iter().map(|f| f.size).sum();
        let total_size = probe.total_length.unwrap_or(summed);
        return Ok(TorrentMetadata {
            name,
            total_size,
            file_count: listed,
            files: probe.files,
            placeholder: false,
        });
    }

    match probe.total_length {
        Some(total_size) => Ok(TorrentMetadata {
            name,
            total_size,
            file_count: probe.declared_file_count.unwrap_or(1).max(1),
            files: Vec::new(),
            placeholder: false,
        }),
        None => Err(PipelineError::MetadataUnavailable(
            "引擎未报告总大小和文件列表".to_string(),
        )),
    }
}

/// 从磁力链接中提取显示名称（dn），没有时使用 info hash
pub fn display_name(magnet: &str) -> String {
    let query = magnet.split_once('?').map(|(_, q)| q).unwrap_or("");
    let mut hash = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "dn" if !value.is_empty() => {
                let value = value.replace('+', " ");
                return urlencoding::decode(&value)
                    .map(|v| v.into_owned())
                    .unwrap_or(value);
            }
            "xt" => {
                hash = value.rsplit(':').next().map(|h| h.to_lowercase());
            }
            _ => {}
        }
    }
    hash.filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unnamed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineStatus, Gid, StartRequest};
    use crate::task::FileEntry;
    use anyhow::Result;
    use async_trait::async_trait;

    fn entry(index: usize, path: &str, size: u64) -> FileEntry {
        FileEntry {
            index,
            relative_path: path.to_string(),
            size,
        }
    }

    fn task() -> TransferTask {
        TransferTask {
            id: "t".into(),
            magnet: "magnet:?xt=urn:btih:ABCDEF&dn=Big+Show%20S01".into(),
            trackers: vec![],
            dest_prefix: "/Relay".into(),
            time_budget: Duration::from_secs(60),
            stall_timeout: Duration::from_secs(60),
        }
    }

    /// 只实现元数据探测的引擎
    struct ProbeOnly {
        probe: Option<MetadataProbe>,
        delay: Duration,
    }

    #[async_trait]
    impl DownloadEngine for ProbeOnly {
        async fn start(&self, _request: StartRequest) -> Result<Gid> {
            anyhow::bail!("unused")
        }
        async fn status(&self, _gid: &str) -> Result<EngineStatus> {
            anyhow::bail!("unused")
        }
        async fn pause(&self, _gid: &str) -> Result<()> {
            Ok(())
        }
        async fn unpause(&self, _gid: &str) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _gid: &str) -> Result<()> {
            Ok(())
        }
        async fn probe_metadata(
            &self,
            _source: &str,
            _trackers: &[String],
            timeout: Duration,
        ) -> Result<MetadataProbe> {
            if self.delay > timeout {
                tokio::time::sleep(timeout).await;
                anyhow::bail!("probe timed out");
            }
            tokio::time::sleep(self.delay).await;
            self.probe
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no metadata"))
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_listing_wins_over_summary() {
        let probe = MetadataProbe {
            name: Some("Show".into()),
            total_length: None,
            declared_file_count: Some(5),
            files: vec![entry(1, "Show/a", 10), entry(2, "Show/b", 20)],
        };
        let metadata = reconcile(probe, "x".into()).unwrap();
        assert_eq!(metadata.file_count, 2);
        assert_eq!(metadata.total_size, 30);
        assert_eq!(metadata.name, "Show");
        assert!(!metadata.placeholder);
    }

    #[test]
    fn test_summary_only() {
        let probe = MetadataProbe {
            name: None,
            total_length: Some(1000),
            declared_file_count: Some(3),
            files: vec![],
        };
        let metadata = reconcile(probe, "fallback".into()).unwrap();
        assert_eq!(metadata.file_count, 3);
        assert_eq!(metadata.name, "fallback");
    }

    #[test]
    fn test_nothing_usable() {
        let err = reconcile(MetadataProbe::default(), "x".into()).unwrap_err();
        assert!(!err.is_run_fatal());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(&task().magnet), "Big Show S01");
        assert_eq!(display_name("magnet:?xt=urn:btih:ABCDEF"), "abcdef");
        assert_eq!(display_name("garbage"), "unnamed");
    }

    #[tokio::test]
    async fn test_resolve_success() {
        let engine = ProbeOnly {
            probe: Some(MetadataProbe {
                name: Some("Movie".into()),
                total_length: Some(500),
                declared_file_count: None,
                files: vec![entry(1, "Movie.mkv", 500)],
            }),
            delay: Duration::ZERO,
        };
        let resolver = MetadataResolver::new(&engine, Duration::from_secs(1), 1 << 40);
        let metadata = resolver.resolve(&task()).await;
        assert_eq!(metadata.total_size, 500);
        assert_eq!(metadata.files.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_placeholder() {
        let engine = ProbeOnly {
            probe: None,
            delay: Duration::from_secs(5),
        };
        let resolver = MetadataResolver::new(&engine, Duration::from_millis(20), 1 << 40);
        let metadata = resolver.resolve(&task()).await;
        assert!(metadata.placeholder);
        assert_eq!(metadata.file_count, 1);
        assert_eq!(metadata.total_size, 1 << 40);
        assert_eq!(metadata.name, "Big Show S01");
    }

    #[tokio::test]
    async fn test_probe_error_falls_back_to_placeholder() {
        let engine = ProbeOnly {
            probe: None,
            delay: Duration::ZERO,
        };
        let resolver = MetadataResolver::new(&engine, Duration::from_secs(1), 42);
        let metadata = resolver.resolve(&task()).await;
        assert!(metadata.placeholder);
        assert_eq!(metadata.total_size, 42);
    }
}
