//! 宿主异步调度器
//!
//! 拥有一个 tokio 多线程运行时，供网络、文件和定时器等宿主操作使用。
//! 任务在工作线程上运行，结果经由异步解析桥回到 VM 线程。

use crate::config::SchedulerConfig;
use crate::core::error::{AsyncError, AsyncResult, BridgeResult};
use futures::future::BoxFuture;
use std::cell::RefCell;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// 宿主调度器
pub struct HostScheduler {
    runtime: RefCell<Option<Runtime>>,
    workers: usize,
}

impl HostScheduler {
    pub fn new(config: &SchedulerConfig) -> BridgeResult<Self> {
        let workers = config.effective_workers();
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()?;

        tracing::info!(
            target: "bridge.async",
            "Host scheduler started with {} worker threads ({})",
            workers,
            config.thread_name
        );

        Ok(Self {
            runtime: RefCell::new(Some(runtime)),
            workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.borrow().is_none()
    }

    /// 在工作线程上运行 future
    pub fn spawn<F>(&self, future: F) -> AsyncResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime
            .borrow()
            .as_ref()
            .map(|runtime| runtime.spawn(future))
            .ok_or(AsyncError::SchedulerShutdown)
    }

    pub fn spawn_boxed(&self, future: BoxFuture<'static, ()>) -> AsyncResult<JoinHandle<()>> {
        self.spawn(future)
    }

    /// 在阻塞线程池上运行同步任务
    pub fn spawn_blocking<F, R>(&self, task: F) -> AsyncResult<JoinHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.runtime
            .borrow()
            .as_ref()
            .map(|runtime| runtime.spawn_blocking(task))
            .ok_or(AsyncError::SchedulerShutdown)
    }

    /// 在当前线程上阻塞等待 future 完成
    pub fn block_on<F: Future>(&self, future: F) -> AsyncResult<F::Output> {
        self.runtime
            .borrow()
            .as_ref()
            .map(|runtime| runtime.block_on(future))
            .ok_or(AsyncError::SchedulerShutdown)
    }

    /// 关闭运行时，未完成的任务被丢弃
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.borrow_mut().take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            tracing::info!(target: "bridge.async", "Host scheduler shut down");
        }
    }
}

impl Drop for HostScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
