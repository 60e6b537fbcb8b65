//! 运行作用域
//!
//! 每次运行（以及每个下载周期）一个作用域：所有后台任务（状态轮询、停滞检测、超时定时器）
//! 都注册到同一个 CancellationToken 上。终止原因只能被设置一次，
//! 第一个调用 `terminate` 的任务胜出并取消全部任务，之后的调用一律返回 false。

use crate::engine::EngineStatus;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 终止原因
#[derive(Debug, Clone)]
pub enum Terminal {
    /// 下载完成
    Complete(Box<EngineStatus>),
    /// 停滞
    Stalled { idle: Duration },
    /// 超出时间预算
    TimedOut { budget: Duration },
    /// 引擎报告失败
    Failed { code: String, message: String },
    /// 被调用方主动中止（如上传失败）
    Aborted(String),
}

impl Terminal {
    pub fn is_success(&self) -> bool {
        matches!(self, Terminal::Complete(_))
    }
}

/// 运行作用域
#[derive(Debug)]
pub struct RunScope {
    token: CancellationToken,
    terminal: Mutex<Option<Terminal>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// 成功设置终止原因的次数（只可能是 0 或 1）
    fired: AtomicUsize,
}

impl Default for RunScope {
    fn default() -> Self {
        Self::with_token(CancellationToken::new())
    }
}

impl RunScope {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            terminal: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            fired: AtomicUsize::new(0),
        }
    }

    /// 创建子作用域：父作用域取消时子作用域随之取消，反之不影响父作用域
    pub fn child(&self) -> Self {
        Self::with_token(self.token.child_token())
    }

    /// 注册后台任务，作用域取消时任务在下一个等待点退出
    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("后台任务已取消: {}", name),
                _ = fut => debug!("后台任务已结束: {}", name),
            }
        });
        self.tasks.lock().push(handle);
    }

    /// 设置终止原因并取消全部任务；只有第一次调用返回 true
    pub fn terminate(&self, reason: Terminal) -> bool {
        {
            let mut terminal = self.terminal.lock();
            if terminal.is_some() || self.token.is_cancelled() {
                return false;
            }
            *terminal = Some(reason);
        }
        self.fired.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        true
    }

    /// 终止原因
    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal.lock().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待作用域被取消（无论成功或失败）
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// 仅在以失败原因终止时返回；成功完成时永远挂起
    pub async fn failed(&self) {
        self.token.cancelled().await;
        if matches!(self.terminal(), Some(t) if t.is_success()) {
            std::future::pending::<()>().await;
        }
    }

    /// 等待所有已注册任务退出
    pub async fn join_all(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// 成功终止次数
    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }

    /// 当前仍在运行的后台任务数
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|h| !h.is_finished()).count()
    }
}
