//! 磁盘空间背压
//!
//! 与上传轮询同频采样下载目录所在卷的剩余空间：
//! 低于低水位时暂停下载引擎，只有剩余空间超过高水位才恢复（滞回，避免在边界反复暂停/恢复）。
//! 背压只是节流，不会终止运行。

use crate::supervisor::DownloadSupervisor;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use tracing::{info, warn};

/// 剩余空间探测
pub trait FreeSpaceProbe: Send + Sync {
    /// 返回 `path` 所在卷的可用字节数
    fn free_bytes(&self, path: &Path) -> Result<u64>;
}

/// 基于 sysinfo 的探测：选取挂载点为路径最长前缀的磁盘
#[derive(Debug, Default)]
pub struct SystemFreeSpace;

impl FreeSpaceProbe for SystemFreeSpace {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| anyhow::anyhow!("找不到路径所在的磁盘: {}", path.display()))
    }
}

/// 背压动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    Pause,
    Resume,
    Hold,
}

/// 磁盘空间背压控制器
pub struct DiskBackpressure {
    probe: Arc<dyn FreeSpaceProbe>,
    dir: PathBuf,
    low_watermark: u64,
    high_watermark: u64,
    paused: bool,
}

impl DiskBackpressure {
    pub fn new(
        probe: Arc<dyn FreeSpaceProbe>,
        dir: impl Into<PathBuf>,
        low_watermark: u64,
        high_watermark: u64,
    ) -> Self {
        Self {
            probe,
            dir: dir.into(),
            low_watermark,
            high_watermark,
            paused: false,
        }
    }

    #[cfg(test)]
    fn is_paused(&self) -> bool {
        self.paused
    }

    /// 根据剩余空间决定动作（纯状态转换）
    pub fn evaluate(&mut self, free: u64) -> BackpressureAction {
        if !self.paused && free < self.low_watermark {
            self.paused = true;
            BackpressureAction::Pause
        } else if self.paused && free > self.high_watermark {
            self.paused = false;
            BackpressureAction::Resume
        } else {
            BackpressureAction::Hold
        }
    }

    /// 采样一次并对下载施加暂停/恢复
    ///
    /// 采样或引擎命令失败只记录日志；命令失败时回滚状态，下次采样重试。
    pub async fn regulate(&mut self, supervisor: &DownloadSupervisor) {
        let free = match self.probe.free_bytes(&self.dir) {
            Ok(free) => free,
            Err(e) => {
                warn!("磁盘空间采样失败: {:#}", e);
                return;
            }
        };

        match self.evaluate(free) {
            BackpressureAction::Pause => {
                info!(
                    "剩余空间 {} 字节低于低水位 {}，暂停下载",
                    free, self.low_watermark
                );
                if let Err(e) = supervisor.pause().await {
                    warn!("暂停下载失败: {}", e);
                    self.paused = false;
                }
            }
            BackpressureAction::Resume => {
                info!(
                    "剩余空间 {} 字节超过高水位 {}，恢复下载",
                    free, self.high_watermark
                );
                if let Err(e) = supervisor.resume().await {
                    warn!("恢复下载失败: {}", e);
                    self.paused = true;
                }
            }
            BackpressureAction::Hold => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{RunScope, SupervisorConfig};
    use crate::testing::{FixedFreeSpace, ScriptedEngine, Step};
    use std::time::Duration;

    fn controller(probe: Arc<dyn FreeSpaceProbe>) -> DiskBackpressure {
        DiskBackpressure::new(probe, "/tmp", 100, 200)
    }

    #[test]
    fn test_hysteresis() {
        let mut bp = controller(Arc::new(SystemFreeSpace));
        assert_eq!(bp.evaluate(500), BackpressureAction::Hold);
        assert_eq!(bp.evaluate(99), BackpressureAction::Pause);
        assert!(bp.is_paused());
        // 回到低水位之上但未超过高水位：保持暂停
        assert_eq!(bp.evaluate(150), BackpressureAction::Hold);
        assert_eq!(bp.evaluate(200), BackpressureAction::Hold);
        assert!(bp.is_paused());
        assert_eq!(bp.evaluate(201), BackpressureAction::Resume);
        assert!(!bp.is_paused());
        assert_eq!(bp.evaluate(150), BackpressureAction::Hold);
    }

    #[test]
    fn test_pause_issued_once() {
        let mut bp = controller(Arc::new(SystemFreeSpace));
        assert_eq!(bp.evaluate(10), BackpressureAction::Pause);
        assert_eq!(bp.evaluate(5), BackpressureAction::Hold);
        assert_eq!(bp.evaluate(0), BackpressureAction::Hold);
    }

    #[test]
    fn test_system_probe_reports_some_space() {
        let dir = tempfile::tempdir().unwrap();
        // 某些容器环境下没有可识别的磁盘，只要求不 panic
        let _ = SystemFreeSpace.free_bytes(dir.path());
    }

    #[tokio::test]
    async fn test_regulate_pauses_and_resumes_engine() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::progress(10, 100, 1)]));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(
            engine.clone(),
            "g1".into(),
            SupervisorConfig {
                poll_interval: Duration::from_millis(5),
                liveness_interval: Duration::from_millis(5),
                stall_timeout: Duration::from_secs(5),
                budget: Duration::from_secs(5),
            },
            &root,
        );

        let probe = Arc::new(FixedFreeSpace::new(50));
        let mut bp = controller(probe.clone());
        bp.regulate(&sup).await;
        assert!(sup.is_paused());
        assert_eq!(engine.pauses(), 1);

        probe.set(150);
        bp.regulate(&sup).await;
        assert!(sup.is_paused());

        probe.set(250);
        bp.regulate(&sup).await;
        assert!(!sup.is_paused());
        assert_eq!(engine.unpauses(), 1);

        sup.abort("test done").await;
    }
}
