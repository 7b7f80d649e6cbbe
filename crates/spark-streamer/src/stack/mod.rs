//! # 流式读取栈
//!
//! ## 设计背景（Why）
//! - 每一层只关心自己的职责（拆分、缓存、物理 I/O），通过显式的 `next` 链接组成自上而下的栈；
//! - 驱动线程独占整条栈，层内状态无需加锁，上下文以 `&mut StreamerContext` 显式传入。
//!
//! ## 契约说明（What）
//! - `prepare_request`：提交时自上而下的变换；到达栈底仍无人处理的请求进入上下文的已准备队列；
//! - `queue_request`：栈有空位时交付执行；底层必须消费每一个请求，不认识的请求以 `Unsupported` 失败；
//! - `execute_requests`：推进在途工作，返回是否取得进展；
//! - `available_request_slots`：还能接收多少数据请求，永不为负；
//! - 其余方法（完成时间预估、文件大小、缓存刷新、统计）默认转发给 `next`。
//!
//! ## 风险提示（Trade-offs）
//! - 物理读取在驱动线程上同步进行，慢设备会推迟回调与新请求的接收。

mod read_splitter;
mod storage_drive;

use std::{sync::Arc, time::Instant};

pub use self::{read_splitter::ReadSplitter, storage_drive::StorageDrive};
use crate::{
    config::{DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_FILE_HANDLES, LayerConfig, StreamerConfig},
    context::StreamerContext,
    error::{FailureKind, RequestFailure},
    fs::FileSystem,
    path::RequestPath,
    request::{Command, RequestId},
    statistics::Statistic,
};

/// 每一层共有的名称与下游链接。
pub struct StackEntryBase {
    name: String,
    next: Option<Box<dyn StreamStackEntry>>,
}

impl StackEntryBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// 栈层协议。
pub trait StreamStackEntry: Send {
    fn base(&self) -> &StackEntryBase;

    fn base_mut(&mut self) -> &mut StackEntryBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn set_next(&mut self, next: Box<dyn StreamStackEntry>) {
        self.base_mut().next = Some(next);
    }

    fn next(&self) -> Option<&(dyn StreamStackEntry + 'static)> {
        self.base().next.as_deref()
    }

    fn next_mut(&mut self) -> Option<&mut (dyn StreamStackEntry + 'static)> {
        self.base_mut().next.as_deref_mut()
    }

    fn prepare_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        match self.next_mut() {
            Some(next) => next.prepare_request(ctx, id),
            None => ctx.push_prepared_request(id),
        }
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        match self.next_mut() {
            Some(next) => next.queue_request(ctx, id),
            None => reject_unsupported(ctx, id),
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        self.next_mut()
            .is_some_and(|next| next.execute_requests(ctx))
    }

    fn available_request_slots(&self) -> usize {
        self.next()
            .map_or(0, |next| next.available_request_slots())
    }

    /// 按执行顺序估算完成时间：先是各层自身排队的请求，再是 `internal_pending`，最后是 `external_pending`。
    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &[RequestId],
        external_pending: &[RequestId],
    ) {
        if let Some(next) = self.next_mut() {
            next.update_completion_estimates(ctx, now, internal_pending, external_pending);
        }
    }

    fn file_size(&self, path: &RequestPath) -> Option<u64> {
        self.next().and_then(|next| next.file_size(path))
    }

    fn flush_cache(&mut self, path: &RequestPath) {
        if let Some(next) = self.next_mut() {
            next.flush_cache(path);
        }
    }

    fn flush_entire_cache(&mut self) {
        if let Some(next) = self.next_mut() {
            next.flush_entire_cache();
        }
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        if let Some(next) = self.next() {
            next.collect_statistics(out);
        }
    }
}

fn reject_unsupported(ctx: &mut StreamerContext, id: RequestId) {
    let kind = ctx
        .request(id)
        .map_or("unknown", |request| request.command().kind_name());
    ctx.fail(id, RequestFailure::unsupported(kind));
}

/// 为 `parent` 派生一组子请求并放入已准备队列，父请求进入 `Processing`。
///
/// 子请求分配失败时停止派生：已派生的子请求照常执行，父请求最终以失败终结；
/// 一个都没派生出来则父请求立即失败。
pub(crate) fn spawn_children(
    ctx: &mut StreamerContext,
    parent: RequestId,
    commands: impl IntoIterator<Item = Command>,
    mut sink: impl FnMut(&mut StreamerContext, RequestId),
) -> usize {
    ctx.start_processing(parent);
    let mut spawned = 0;
    for command in commands {
        match ctx.create_child(parent, command) {
            Ok(child) => {
                sink(ctx, child);
                spawned += 1;
            }
            Err(err) => {
                let failure = RequestFailure::new(
                    FailureKind::ResourceExhausted,
                    format!("cannot allocate child request: {err}"),
                );
                if spawned == 0 {
                    ctx.fail(parent, failure);
                } else if let Some(request) = ctx.request_mut(parent) {
                    request.set_failure(failure);
                }
                break;
            }
        }
    }
    spawned
}

/// 按配置自下而上组装栈，返回最顶层。
pub fn build_stack(config: &StreamerConfig, fs: Arc<dyn FileSystem>) -> Box<dyn StreamStackEntry> {
    let mut top: Option<Box<dyn StreamStackEntry>> = None;
    for layer in config.stack.iter().rev() {
        let mut entry: Box<dyn StreamStackEntry> = match *layer {
            LayerConfig::StorageDrive {
                max_file_handles,
                max_concurrent_requests,
            } => Box::new(StorageDrive::new(
                Arc::clone(&fs),
                max_file_handles,
                max_concurrent_requests,
            )),
            LayerConfig::ReadSplitter { max_read_size } => Box::new(ReadSplitter::new(max_read_size)),
        };
        if let Some(next) = top.take() {
            entry.set_next(next);
        }
        top = Some(entry);
    }
    top.unwrap_or_else(|| {
        Box::new(StorageDrive::new(
            fs,
            DEFAULT_MAX_FILE_HANDLES,
            DEFAULT_MAX_CONCURRENT_REQUESTS,
        ))
    })
}

/// 自顶向下列出各层名称。
pub fn layer_names(stack: &dyn StreamStackEntry) -> Vec<String> {
    let mut names = vec![stack.name().to_owned()];
    let mut cursor = stack.next();
    while let Some(entry) = cursor {
        names.push(entry.name().to_owned());
        cursor = entry.next();
    }
    names
}
