//! 下载监督器
//!
//! 一个下载周期由三个后台任务共同监督，全部注册在同一个 [`RunScope`] 上：
//! - 状态轮询：定期查询引擎状态，记录前进信号，检测完成与失败
//! - 停滞检测：距上次前进超过停滞阈值则判定停滞
//! - 超时定时器：超过绝对时间预算则判定超时
//!
//! 三者中第一个得出终止结论的任务胜出，其余任务随作用域一起取消。

pub mod scope;

pub use scope::{RunScope, Terminal};

use crate::engine::{DownloadEngine, EngineState, EngineStatus, Gid};
use crate::error::{PipelineError, PipelineResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 连续状态查询失败上限，超过后认为引擎已不可用
const MAX_STATUS_FAILURES: u32 = 10;

/// 监督器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Active,
    Stalled,
    TimedOut,
    Failed,
    Complete,
}

/// 监督参数
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// 状态轮询间隔
    pub poll_interval: Duration,
    /// 停滞检测间隔
    pub liveness_interval: Duration,
    /// 无前进超过该时长判定停滞
    pub stall_timeout: Duration,
    /// 本周期的绝对时间预算
    pub budget: Duration,
}

/// 下载状态（轮询任务写入，其他组件读取）
#[derive(Debug, Clone)]
pub struct DownloadState {
    pub gid: Gid,
    pub state: SupervisorState,
    pub last_progress: Instant,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub download_speed: u64,
    pub connections: u32,
    pub paused: bool,
    /// 最近一次结构化的状态查询（不含控制台估算值）
    pub latest: Option<EngineStatus>,
}

impl DownloadState {
    fn new(gid: Gid) -> Self {
        Self {
            gid,
            state: SupervisorState::Starting,
            last_progress: Instant::now(),
            completed_bytes: 0,
            total_bytes: 0,
            download_speed: 0,
            connections: 0,
            paused: false,
            latest: None,
        }
    }

    /// 记录一次观测，返回是否有前进
    ///
    /// 控制台估算值只用于判断是否前进，不覆盖计数，也不作为最新状态交给上传侧。
    fn observe(&mut self, status: &EngineStatus) -> bool {
        let forward = status.completed_length > self.completed_bytes
            || (status.connections > 0 && self.connections == 0);
        if forward {
            self.last_progress = Instant::now();
        }
        if self.state == SupervisorState::Starting {
            self.state = SupervisorState::Active;
        }
        if status.estimated {
            return forward;
        }

        self.completed_bytes = self.completed_bytes.max(status.completed_length);
        // 元数据阶段的大小是元数据本身的大小
        if status.total_length > 0 && !status.metadata_phase {
            self.total_bytes = status.total_length;
        }
        self.download_speed = status.download_speed;
        self.connections = status.connections;
        self.latest = Some(status.clone());
        forward
    }

    /// 转为跟踪衍生任务，计数从零开始
    fn follow(&mut self, next: Gid) {
        self.gid = next;
        self.last_progress = Instant::now();
        self.completed_bytes = 0;
        self.connections = 0;
        self.latest = None;
    }
}

/// 下载监督器
pub struct DownloadSupervisor {
    engine: Arc<dyn DownloadEngine>,
    state: Arc<Mutex<DownloadState>>,
    scope: Arc<RunScope>,
    config: SupervisorConfig,
}

impl DownloadSupervisor {
    /// 在 `parent` 的子作用域中开始监督 `gid`
    pub fn launch(
        engine: Arc<dyn DownloadEngine>,
        gid: Gid,
        config: SupervisorConfig,
        parent: &RunScope,
    ) -> Self {
        let supervisor = Self {
            engine,
            state: Arc::new(Mutex::new(DownloadState::new(gid.clone()))),
            scope: Arc::new(parent.child()),
            config,
        };
        info!(
            "开始监督下载: gid={}, 预算={:?}, 停滞阈值={:?}",
            gid, supervisor.config.budget, supervisor.config.stall_timeout
        );
        supervisor.spawn_poller();
        supervisor.spawn_liveness();
        supervisor.spawn_deadline();
        supervisor
    }

    fn spawn_poller(&self) {
        let engine = self.engine.clone();
        let state = self.state.clone();
        let scope = self.scope.clone();
        let interval = self.config.poll_interval;

        self.scope.spawn("status-poller", async move {
            let mut failures = 0u32;
            loop {
                let gid = state.lock().gid.clone();
                match engine.status(&gid).await {
                    Ok(status) => {
                        failures = 0;
                        if poll_once(&state, &scope, status) {
                            return;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        warn!("查询下载状态失败 ({}/{}): {:#}", failures, MAX_STATUS_FAILURES, e);
                        if failures >= MAX_STATUS_FAILURES {
                            state.lock().state = SupervisorState::Failed;
                            scope.terminate(Terminal::Failed {
                                code: "unreachable".to_string(),
                                message: format!("{:#}", e),
                            });
                            return;
                        }
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    fn spawn_liveness(&self) {
        let state = self.state.clone();
        let scope = self.scope.clone();
        let interval = self.config.liveness_interval;
        let stall_timeout = self.config.stall_timeout;

        self.scope.spawn("liveness", async move {
            loop {
                tokio::time::sleep(interval).await;
                let idle = {
                    let mut s = state.lock();
                    if s.paused {
                        // 暂停期间不计入停滞
                        s.last_progress = Instant::now();
                        continue;
                    }
                    s.last_progress.elapsed()
                };
                if idle > stall_timeout {
                    if scope.terminate(Terminal::Stalled { idle }) {
                        state.lock().state = SupervisorState::Stalled;
                        warn!("下载停滞: 已 {:?} 无进展", idle);
                    }
                    return;
                }
            }
        });
    }

    fn spawn_deadline(&self) {
        let state = self.state.clone();
        let scope = self.scope.clone();
        let budget = self.config.budget;

        self.scope.spawn("deadline", async move {
            tokio::time::sleep(budget).await;
            if scope.terminate(Terminal::TimedOut { budget }) {
                state.lock().state = SupervisorState::TimedOut;
                warn!("下载超时: 预算 {:?} 已用尽", budget);
            }
        });
    }

    /// 监督作用域
    pub fn scope(&self) -> &RunScope {
        &self.scope
    }

    /// 当前状态快照
    pub fn snapshot(&self) -> DownloadState {
        self.state.lock().clone()
    }

    /// 当前跟踪的 gid
    pub fn gid(&self) -> Gid {
        self.state.lock().gid.clone()
    }

    /// 暂停下载
    pub async fn pause(&self) -> PipelineResult<()> {
        let gid = self.gid();
        self.engine.pause(&gid).await.map_err(PipelineError::Engine)?;
        self.state.lock().paused = true;
        Ok(())
    }

    /// 恢复下载，停滞计时从恢复时刻重新开始
    pub async fn resume(&self) -> PipelineResult<()> {
        let gid = self.gid();
        self.engine.unpause(&gid).await.map_err(PipelineError::Engine)?;
        let mut s = self.state.lock();
        s.paused = false;
        s.last_progress = Instant::now();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// 从外部中止本周期（如上传失败），并强制终止引擎任务
    pub async fn abort(&self, reason: &str) {
        if self.scope.terminate(Terminal::Aborted(reason.to_string())) {
            self.state.lock().state = SupervisorState::Failed;
        }
        self.scope.join_all().await;
        self.kill().await;
    }

    /// 等待本周期结束
    ///
    /// 返回前所有后台任务都已退出；非成功结束时引擎任务会被强制移除。
    pub async fn finish(&self) -> PipelineResult<EngineStatus> {
        self.scope.cancelled().await;
        self.scope.join_all().await;

        let outcome = match self.scope.terminal() {
            Some(Terminal::Complete(status)) => return Ok(*status),
            Some(Terminal::Stalled { idle }) => PipelineError::DownloadStalled { idle },
            Some(Terminal::TimedOut { budget }) => PipelineError::DownloadTimedOut { budget },
            Some(Terminal::Failed { code, message }) => {
                PipelineError::DownloadFailed { code, message }
            }
            Some(Terminal::Aborted(reason)) => {
                PipelineError::Engine(anyhow::anyhow!("下载已中止: {}", reason))
            }
            None => PipelineError::Engine(anyhow::anyhow!("运行已取消")),
        };
        self.kill().await;
        Err(outcome)
    }

    async fn kill(&self) {
        let gid = self.gid();
        if let Err(e) = self.engine.remove(&gid).await {
            debug!("移除引擎任务失败（可能已结束）: gid={}, {:#}", gid, e);
        }
    }
}

/// 处理一次状态观测，返回轮询是否应结束
fn poll_once(state: &Mutex<DownloadState>, scope: &RunScope, status: EngineStatus) -> bool {
    if status.failed() {
        state.lock().state = SupervisorState::Failed;
        let code = status.error_code.clone().unwrap_or_else(|| "error".to_string());
        let message = status.error_message.clone().unwrap_or_default();
        scope.terminate(Terminal::Failed { code, message });
        return true;
    }

    // 元数据任务完成后转为跟踪衍生的真实下载任务
    if status.state == EngineState::Complete {
        if let Some(next) = status.followed_by.first() {
            let mut s = state.lock();
            if s.gid != *next {
                info!("元数据阶段结束，跟踪下载任务: {} -> {}", s.gid, next);
                s.follow(next.clone());
                return false;
            }
        }
    }

    let forward = state.lock().observe(&status);
    if forward {
        debug!(
            "下载进度: {}/{} 字节, 连接数 {}",
            status.completed_length, status.total_length, status.connections
        );
    }

    match status.state {
        EngineState::Complete if status.completed_length >= status.total_length => {
            if scope.terminate(Terminal::Complete(Box::new(status))) {
                state.lock().state = SupervisorState::Complete;
                info!("下载完成");
            }
            true
        }
        EngineState::Removed => {
            state.lock().state = SupervisorState::Failed;
            scope.terminate(Terminal::Failed {
                code: "removed".to_string(),
                message: "引擎任务已被移除".to_string(),
            });
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedEngine, Step};

    fn config(stall_ms: u64, budget_ms: u64) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(5),
            liveness_interval: Duration::from_millis(5),
            stall_timeout: Duration::from_millis(stall_ms),
            budget: Duration::from_millis(budget_ms),
        }
    }

    #[tokio::test]
    async fn test_completes() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Step::progress(0, 100, 2),
            Step::progress(50, 100, 2),
            Step::complete(100),
        ]));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(engine.clone(), "g1".into(), config(1000, 5000), &root);
        let status = sup.finish().await.unwrap();
        assert_eq!(status.completed_length, 100);
        assert_eq!(sup.snapshot().state, SupervisorState::Complete);
        assert_eq!(engine.removed(), 0);
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_stall_fires_exactly_once() {
        // 进度停在 10 字节不再变化
        let engine = Arc::new(ScriptedEngine::new(vec![Step::progress(10, 100, 0)]));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(engine.clone(), "g1".into(), config(40, 120), &root);

        let err = sup.finish().await.unwrap_err();
        assert!(matches!(err, PipelineError::DownloadStalled { .. }));
        assert_eq!(sup.scope().fired(), 1);
        assert_eq!(sup.scope().active_tasks(), 0);

        // 超时时间点过后也不会二次触发
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(sup.scope().terminal(), Some(Terminal::Stalled { .. })));
        assert_eq!(engine.removed(), 1);
    }

    #[tokio::test]
    async fn test_timeout_while_progressing() {
        // 一直在前进但永远完成不了
        let engine = Arc::new(ScriptedEngine::endless_progress(1_000_000));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(engine.clone(), "g1".into(), config(1000, 60), &root);
        let err = sup.finish().await.unwrap_err();
        assert!(matches!(err, PipelineError::DownloadTimedOut { .. }));
        assert_eq!(engine.removed(), 1);
    }

    #[tokio::test]
    async fn test_engine_failure() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Step::progress(5, 100, 1),
            Step::failed("3", "resource not found"),
        ]));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(engine, "g1".into(), config(1000, 5000), &root);
        match sup.finish().await.unwrap_err() {
            PipelineError::DownloadFailed { code, message } => {
                assert_eq!(code, "3");
                assert_eq!(message, "resource not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_follows_metadata_gid() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            Step::metadata_done("g2"),
            Step::progress(50, 100, 3),
            Step::complete(100),
        ]));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(engine.clone(), "g1".into(), config(1000, 5000), &root);
        sup.finish().await.unwrap();
        assert_eq!(sup.gid(), "g2");
        assert!(engine.queried_gids().contains(&"g2".to_string()));
    }

    fn metadata_status(completed: u64) -> EngineStatus {
        EngineStatus {
            metadata_phase: true,
            bitfield: Some("80".to_string()),
            piece_length: 16_384,
            ..Step::progress(completed, 16_384, 2).into_status()
        }
    }

    #[test]
    fn test_metadata_phase_does_not_leak_into_counters() {
        let scope = RunScope::new();
        let state = Mutex::new(DownloadState::new("meta".into()));
        assert!(!poll_once(&state, &scope, metadata_status(16_000)));
        assert_eq!(state.lock().total_bytes, 0);

        assert!(!poll_once(&state, &scope, Step::metadata_done("real").into_status()));
        let s = state.lock().clone();
        assert_eq!(s.gid, "real");
        assert_eq!(s.completed_bytes, 0);
        assert!(s.latest.is_none());

        // 真实任务从零开始前进，不会被元数据阶段的字节数压住
        assert!(state.lock().observe(&Step::progress(512, 20_480, 3).into_status()));
        assert_eq!(state.lock().total_bytes, 20_480);
    }

    #[test]
    fn test_estimated_status_only_feeds_liveness() {
        let mut state = DownloadState::new("g1".into());
        state.observe(&Step::progress(100, 20_000, 3).into_status());

        let estimated = EngineStatus {
            estimated: true,
            ..Step::progress(512, 19_968, 3).into_status()
        };
        assert!(state.observe(&estimated));
        assert_eq!(state.completed_bytes, 100);
        assert_eq!(state.total_bytes, 20_000);
        let latest = state.latest.as_ref().unwrap();
        assert!(!latest.estimated);
        assert_eq!(latest.total_length, 20_000);
    }

    #[tokio::test]
    async fn test_pause_suspends_stall_detection() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::progress(10, 100, 0)]));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(engine.clone(), "g1".into(), config(30, 5000), &root);
        sup.pause().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sup.scope().is_cancelled());
        sup.resume().await.unwrap();
        let err = sup.finish().await.unwrap_err();
        assert!(matches!(err, PipelineError::DownloadStalled { .. }));
    }

    #[tokio::test]
    async fn test_root_cancellation_stops_cycle() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::progress(10, 100, 1)]));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(engine.clone(), "g1".into(), config(1000, 5000), &root);
        root.terminate(Terminal::Aborted("shutdown".into()));
        assert!(sup.finish().await.is_err());
        assert_eq!(engine.removed(), 1);
    }

    #[tokio::test]
    async fn test_abort_kills_engine() {
        let engine = Arc::new(ScriptedEngine::new(vec![Step::progress(10, 100, 1)]));
        let root = RunScope::new();
        let sup = DownloadSupervisor::launch(engine.clone(), "g1".into(), config(1000, 5000), &root);
        sup.abort("upload failed").await;
        assert_eq!(sup.snapshot().state, SupervisorState::Failed);
        assert_eq!(sup.scope().active_tasks(), 0);
        assert_eq!(engine.removed(), 1);
    }
}
