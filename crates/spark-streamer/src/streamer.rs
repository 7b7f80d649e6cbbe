//! Streamer 门面：持有驱动线程，向调用方提供按命令分类的便捷提交方法。
//!
//! # 契约说明（What）
//! - [`Streamer::start`] 校验配置、组装栈并以配置的线程名启动驱动线程；
//! - 便捷方法都走 [`ContextHandle`] 的“申请 → 配置 → 提交”路径，返回可用于取消或重排的 [`RequestId`]；
//! - 回调在驱动线程上执行，不应阻塞；
//! - Drop 或 [`Streamer::stop`] 关闭提交入口，等待驱动线程排空已接收的请求后返回。

use std::{
    any::Any,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use tracing::{error, info};

use crate::{
    config::StreamerConfig,
    context::ContextHandle,
    error::{Result, StreamerError},
    fs::FileSystem,
    path::RequestPath,
    request::{BatchEntry, CompletedRequest, FileRequest, Priority, RequestId, RequestOutput},
    scheduler::Scheduler,
    statistics::Statistic,
};

pub struct Streamer {
    handle: ContextHandle,
    thread: Option<JoinHandle<()>>,
}

impl Streamer {
    /// 启动驱动线程。
    ///
    /// # 错误
    /// - 配置不合法时返回 [`StreamerError::Config`]；
    /// - 线程创建失败时返回 [`StreamerError::ThreadSpawn`]。
    pub fn start(config: StreamerConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let scheduler = Scheduler::from_config(&config, fs)?;
        let handle = scheduler.handle();
        let idle_tick = config.idle_tick();
        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || scheduler.run(idle_tick))
            .map_err(StreamerError::ThreadSpawn)?;
        info!(thread = %config.thread_name, "streamer started");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// 申请一个空白外部请求，由调用方自行配置后交给 [`Streamer::submit`]。
    pub fn create_request(&self) -> Result<FileRequest> {
        self.handle.get_new_external_request()
    }

    pub fn submit(&self, request: FileRequest) -> Result<RequestId> {
        self.handle.queue_request(request)
    }

    fn submit_with(&self, configure: impl FnOnce(&mut FileRequest)) -> Result<RequestId> {
        let mut request = self.create_request()?;
        configure(&mut request);
        self.submit(request)
    }

    pub fn read(
        &self,
        path: impl Into<RequestPath>,
        offset: u64,
        size: u64,
        callback: impl FnOnce(CompletedRequest) + Send + 'static,
    ) -> Result<RequestId> {
        let path = path.into();
        self.submit_with(move |request| {
            request
                .create_read(path, offset, size)
                .set_completion_callback(callback);
        })
    }

    pub fn read_batch(
        &self,
        entries: Vec<BatchEntry>,
        callback: impl FnOnce(CompletedRequest) + Send + 'static,
    ) -> Result<RequestId> {
        self.submit_with(move |request| {
            request
                .create_read_batch(entries)
                .set_completion_callback(callback);
        })
    }

    pub fn file_exists(
        &self,
        path: impl Into<RequestPath>,
        callback: impl FnOnce(CompletedRequest) + Send + 'static,
    ) -> Result<RequestId> {
        let path = path.into();
        self.submit_with(move |request| {
            request
                .create_file_exists(path)
                .set_completion_callback(callback);
        })
    }

    pub fn file_metadata(
        &self,
        path: impl Into<RequestPath>,
        callback: impl FnOnce(CompletedRequest) + Send + 'static,
    ) -> Result<RequestId> {
        let path = path.into();
        self.submit_with(move |request| {
            request
                .create_file_metadata(path)
                .set_completion_callback(callback);
        })
    }

    /// 取消 `target` 及其全部子请求；目标已终结时取消请求本身仍然成功完成。
    pub fn cancel(&self, target: RequestId) -> Result<RequestId> {
        self.submit_with(|request| {
            request.create_cancel(target);
        })
    }

    pub fn reschedule(
        &self,
        target: RequestId,
        deadline: Option<Instant>,
        priority: Priority,
    ) -> Result<RequestId> {
        self.submit_with(|request| {
            request.create_reschedule(target, deadline, priority);
        })
    }

    pub fn flush_cache(&self, path: impl Into<RequestPath>) -> Result<RequestId> {
        let path = path.into();
        self.submit_with(move |request| {
            request.create_flush(path);
        })
    }

    pub fn flush_entire_cache(&self) -> Result<RequestId> {
        self.submit_with(|request| {
            request.create_flush_all();
        })
    }

    /// 在驱动线程上汇总统计，通过回调交付。
    pub fn collect_statistics(
        &self,
        callback: impl FnOnce(Vec<Statistic>) + Send + 'static,
    ) -> Result<RequestId> {
        self.submit_with(move |request| {
            request
                .create_report()
                .set_completion_callback(move |done| match done.output {
                    RequestOutput::Statistics(values) => callback(values),
                    _ => callback(Vec::new()),
                });
        })
    }

    /// 按提交顺序通过存储驱动的自定义请求，回调收到原样返回的载荷。
    pub fn custom(
        &self,
        payload: Box<dyn Any + Send>,
        callback: impl FnOnce(CompletedRequest) + Send + 'static,
    ) -> Result<RequestId> {
        self.submit_with(move |request| {
            request
                .create_custom(payload)
                .set_completion_callback(callback);
        })
    }

    pub fn suspend_processing(&self) {
        self.handle.suspend_processing();
    }

    pub fn resume_processing(&self) {
        self.handle.resume_processing();
    }

    /// 关闭并等待驱动线程退出。
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.request_shutdown();
        if thread.join().is_err() {
            error!("streamer driver thread panicked");
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
