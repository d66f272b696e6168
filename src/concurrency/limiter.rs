//! Limiter - 有界并发准入
//!
//! - 最多 `max_concurrent` 个任务同时运行
//! - 超出的任务按到达顺序 (FIFO) 排队
//! - 任务失败或 panic 时总会释放占用的槽位
//! - 每个任务的结果通过独立的 [`TaskHandle`] 返回

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// 调度错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    /// 调度器已关闭，任务未被接受
    #[error("limiter is shut down")]
    Closed,
    /// 任务在运行中 panic
    #[error("scheduled task panicked")]
    Panicked,
}

/// Limiter 统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LimiterStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub completed: u64,
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// 有界并发调度器
///
/// 内部由一个分发任务按到达顺序取出排队的任务，先获取 Semaphore 许可再启动，
/// 因此排在后面的任务永远不会越过前面的任务。
pub struct Limiter {
    max_concurrent: usize,
    tx: mpsc::UnboundedSender<Job>,
    counters: Arc<Counters>,
}

impl Limiter {
    /// 创建调度器。`max_concurrent` 最小为 1。
    ///
    /// 必须在 tokio runtime 中调用。
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        tokio::spawn(dispatch(rx, semaphore, Arc::clone(&counters)));

        Self {
            max_concurrent,
            tx,
            counters,
        }
    }

    /// 提交任务。立即返回，任务在获得槽位后执行。
    pub fn schedule<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let counters = Arc::clone(&self.counters);

        let job: Job = Box::pin(async move {
            let guard = RunGuard::enter(counters);
            let output = task().await;
            guard.finish();
            // 调用方可能已丢弃 handle
            let _ = result_tx.send(output);
        });

        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            return TaskHandle { rx: None };
        }
        TaskHandle { rx: Some(result_rx) }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            max_concurrent: self.max_concurrent,
            running: self.counters.running.load(Ordering::SeqCst),
            queued: self.counters.queued.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            panicked: self.counters.panicked.load(Ordering::SeqCst),
        }
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Job>,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        counters.queued.fetch_sub(1, Ordering::SeqCst);
        tokio::spawn(async move {
            // 许可随任务结束 (包括 panic 展开) 一起释放
            let _permit = permit;
            job.await;
        });
    }
    debug!("Limiter dispatcher stopped");
}

/// 运行计数守卫。未调用 `finish` 就被丢弃说明任务 panic 了。
struct RunGuard {
    counters: Arc<Counters>,
    finished: bool,
}

impl RunGuard {
    fn enter(counters: Arc<Counters>) -> Self {
        counters.running.fetch_add(1, Ordering::SeqCst);
        Self {
            counters,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::SeqCst);
        if self.finished {
            self.counters.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.panicked.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// 单个任务的结果句柄，`await` 得到任务自身的输出。
#[must_use = "dropping the handle discards the task's outcome, the task still runs"]
pub struct TaskHandle<T> {
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, LimiterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            None => Poll::Ready(Err(LimiterError::Closed)),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.map_err(|_| LimiterError::Panicked)),
        }
    }
}
