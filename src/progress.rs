//! 进度上报
//!
//! 监督器和上传调度器可以任意频繁地产生进度快照，
//! 但对外每个最小间隔内至多发出一次，阶段切换也不例外；只有最终的完成记录总会发出。
//! 投递失败一律吞掉，不影响运行结果。

use crate::task::ProgressSnapshot;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 进度接收端
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn deliver(&self, snapshot: &ProgressSnapshot) -> Result<()>;
}

/// 只写日志的接收端（未配置进度回调时使用）
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ProgressSink for LogSink {
    async fn deliver(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        info!(
            "[{}] {}/{} 字节 ({:.1}%), 速度 {} B/s, 已上传 {}",
            snapshot.phase,
            snapshot.downloaded,
            snapshot.total,
            snapshot.percent(),
            snapshot.speed,
            snapshot.uploaded
        );
        Ok(())
    }
}

/// 时间节流器
///
/// 原子 CAS 更新上次发布时间，多个任务并发调用时只有一个能拿到发布权。
#[derive(Debug)]
struct Throttle {
    origin: Instant,
    /// 上次发布时刻（相对 origin 的纳秒数 + 1，0 表示从未发布）
    last_emit: AtomicU64,
    interval_nanos: u64,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64 + 1
    }

    fn try_acquire(&self) -> bool {
        let now = self.now();
        let last = self.last_emit.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        self.last_emit
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    fn force(&self) {
        self.last_emit.store(self.now(), Ordering::Relaxed);
    }
}

/// 限频进度上报器
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    throttle: Throttle,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, interval: Duration) -> Self {
        Self {
            sink,
            throttle: Throttle::new(interval),
        }
    }

    /// 节流上报，返回本次是否实际发出
    pub async fn report(&self, snapshot: &ProgressSnapshot) -> bool {
        if !self.throttle.try_acquire() {
            return false;
        }
        self.deliver(snapshot).await;
        true
    }

    /// 最终记录，不受节流限制
    pub async fn finish(&self, snapshot: &ProgressSnapshot) {
        self.throttle.force();
        self.deliver(snapshot).await;
    }

    async fn deliver(&self, snapshot: &ProgressSnapshot) {
        if let Err(e) = self.sink.deliver(snapshot).await {
            debug!("进度上报失败（已忽略）: {:#}", e);
        }
    }
}
