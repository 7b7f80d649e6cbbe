//! 请求对象与标识。
//!
//! # 契约说明（What）
//! - [`FileRequest`] 是栈内的工作单元：命令 + 状态 + 父子链接 + 完成回调；
//! - [`RequestId`] 是请求在上下文 arena 中的索引与代际号，回收后代际号递增，旧句柄随即失效；
//! - 外部请求由调用方通过 [`crate::context::ContextHandle::get_new_external_request`] 取得并配置，
//!   提交后所有权转移给驱动线程，调用方只持有 `Copy` 的 [`RequestId`]。

mod command;
mod output;
mod status;

use std::{any::Any, fmt, time::Instant};

use bytes::{Bytes, BytesMut};

pub use self::{
    command::{BatchEntry, Command, ReadOutput},
    output::{CompletedRequest, RequestOutput},
    status::RequestStatus,
};
use crate::{
    context::ExternalReservation,
    error::{RequestFailure, Result, StreamerError},
    path::RequestPath,
};

/// 请求来源。决定回收时进入哪个回收站。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestUsage {
    /// 驱动线程内部派生的请求，无锁分配。
    Internal,
    /// 调用方线程申请的请求，经互斥锁分配。
    External,
}

/// 请求句柄：arena 索引 + 代际号 + 来源。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    usage: RequestUsage,
    index: u32,
    generation: u32,
}

impl RequestId {
    pub(crate) const fn new(usage: RequestUsage, index: u32, generation: u32) -> Self {
        Self {
            usage,
            index,
            generation,
        }
    }

    pub const fn usage(self) -> RequestUsage {
        self.usage
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.usage {
            RequestUsage::Internal => "int",
            RequestUsage::External => "ext",
        };
        write!(f, "{prefix}#{}.{}", self.index, self.generation)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 请求优先级，数值越大越先被派发。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const LOW: Priority = Priority(64);
    pub const NORMAL: Priority = Priority(128);
    pub const HIGH: Priority = Priority(192);
    pub const HIGHEST: Priority = Priority(255);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// 完成回调，在驱动线程上恰好调用一次。
pub type CompletionCallback = Box<dyn FnOnce(CompletedRequest) + Send + 'static>;

/// 栈内的工作单元。
pub struct FileRequest {
    id: RequestId,
    command: Command,
    status: RequestStatus,
    deadline: Option<Instant>,
    priority: Priority,
    parent: Option<RequestId>,
    pending_children: u32,
    callback: Option<CompletionCallback>,
    failure: Option<RequestFailure>,
    child_canceled: bool,
    estimated_completion: Option<Instant>,
    queued_at: Option<Instant>,
    reservation: Option<ExternalReservation>,
}

impl FileRequest {
    pub(crate) fn new(id: RequestId) -> Self {
        Self {
            id,
            command: Command::None,
            status: RequestStatus::Pending,
            deadline: None,
            priority: Priority::default(),
            parent: None,
            pending_children: 0,
            callback: None,
            failure: None,
            child_canceled: false,
            estimated_completion: None,
            queued_at: None,
            reservation: None,
        }
    }

    pub(crate) fn with_reservation(id: RequestId, reservation: ExternalReservation) -> Self {
        let mut request = Self::new(id);
        request.reservation = Some(reservation);
        request
    }

    pub const fn id(&self) -> RequestId {
        self.id
    }

    pub const fn status(&self) -> RequestStatus {
        self.status
    }

    pub const fn command(&self) -> &Command {
        &self.command
    }

    pub(crate) fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    pub const fn priority(&self) -> Priority {
        self.priority
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub const fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    pub const fn pending_children(&self) -> u32 {
        self.pending_children
    }

    pub const fn failure(&self) -> Option<&RequestFailure> {
        self.failure.as_ref()
    }

    /// 栈最近一次给出的预计完成时间。
    pub const fn estimated_completion(&self) -> Option<Instant> {
        self.estimated_completion
    }

    pub const fn queued_at(&self) -> Option<Instant> {
        self.queued_at
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// 读取 `path` 中 `[offset, offset + size)` 的字节。
    pub fn create_read(&mut self, path: impl Into<RequestPath>, offset: u64, size: u64) -> &mut Self {
        self.command = Command::ReadRequest {
            path: path.into(),
            offset,
            size,
            output: ReadOutput::default(),
        };
        self
    }

    /// 一次提交多段读取，结果按条目顺序返回。
    pub fn create_read_batch(&mut self, entries: Vec<BatchEntry>) -> &mut Self {
        let results = vec![None; entries.len()];
        self.command = Command::ReadBatch { entries, results };
        self
    }

    pub fn create_file_exists(&mut self, path: impl Into<RequestPath>) -> &mut Self {
        self.command = Command::FileExists {
            path: path.into(),
            found: None,
        };
        self
    }

    pub fn create_file_metadata(&mut self, path: impl Into<RequestPath>) -> &mut Self {
        self.command = Command::FileMetadata {
            path: path.into(),
            size: None,
        };
        self
    }

    pub fn create_cancel(&mut self, target: RequestId) -> &mut Self {
        self.command = Command::Cancel { target };
        self
    }

    pub fn create_reschedule(
        &mut self,
        target: RequestId,
        deadline: Option<Instant>,
        priority: Priority,
    ) -> &mut Self {
        self.command = Command::Reschedule {
            target,
            deadline,
            priority,
        };
        self
    }

    pub fn create_flush(&mut self, path: impl Into<RequestPath>) -> &mut Self {
        self.command = Command::Flush { path: path.into() };
        self
    }

    pub fn create_flush_all(&mut self) -> &mut Self {
        self.command = Command::FlushAll;
        self
    }

    pub fn create_report(&mut self) -> &mut Self {
        self.command = Command::Report {
            statistics: Vec::new(),
        };
        self
    }

    pub fn create_custom(&mut self, payload: Box<dyn Any + Send>) -> &mut Self {
        self.command = Command::Custom {
            payload: Some(payload),
        };
        self
    }

    pub fn with_deadline(&mut self, deadline: Instant) -> &mut Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_priority(&mut self, priority: Priority) -> &mut Self {
        self.priority = priority;
        self
    }

    /// 为读取请求提供调用方缓冲，结果写入其中。对其他命令无效。
    pub fn with_buffer(&mut self, buffer: BytesMut) -> &mut Self {
        if let Command::ReadRequest { output, .. } = &mut self.command {
            *output = ReadOutput::with_target(Some(buffer));
        }
        self
    }

    pub fn set_completion_callback(
        &mut self,
        callback: impl FnOnce(CompletedRequest) + Send + 'static,
    ) -> &mut Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub(crate) fn set_status(&mut self, next: RequestStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StreamerError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn set_failure(&mut self, failure: RequestFailure) {
        self.failure.get_or_insert(failure);
    }

    pub(crate) fn set_schedule(&mut self, deadline: Option<Instant>, priority: Priority) {
        self.deadline = deadline;
        self.priority = priority;
    }

    pub(crate) fn set_parent(&mut self, parent: RequestId) {
        self.parent = Some(parent);
    }

    pub(crate) fn add_pending_child(&mut self) {
        self.pending_children += 1;
    }

    pub(crate) fn set_estimated_completion(&mut self, estimate: Option<Instant>) {
        self.estimated_completion = estimate;
    }

    pub(crate) fn mark_queued(&mut self, now: Instant) {
        self.queued_at = Some(now);
    }

    pub(crate) fn take_callback(&mut self) -> Option<CompletionCallback> {
        self.callback.take()
    }

    pub(crate) fn take_reservation(&mut self) -> Option<ExternalReservation> {
        self.reservation.take()
    }

    /// 子请求是否有任何一个被取消。
    pub(crate) const fn child_canceled(&self) -> bool {
        self.child_canceled
    }

    /// 清空请求内容，换上新标识，供回收后复用。
    pub(crate) fn reset(&mut self, id: RequestId) {
        self.id = id;
        self.command = Command::None;
        self.status = RequestStatus::Pending;
        self.deadline = None;
        self.priority = Priority::default();
        self.parent = None;
        self.pending_children = 0;
        self.callback = None;
        self.failure = None;
        self.child_canceled = false;
        self.estimated_completion = None;
        self.queued_at = None;
        self.reservation = None;
    }

    /// 取出终态请求交给回调的结果。只有成功的请求携带输出，失败与取消丢弃部分数据。
    pub(crate) fn take_completion(&mut self) -> CompletedRequest {
        let output = if self.status == RequestStatus::Completed {
            self.take_output()
        } else {
            self.discard_output();
            RequestOutput::None
        };
        CompletedRequest {
            id: self.id,
            status: self.status,
            output,
            failure: self.failure.clone(),
        }
    }

    fn take_output(&mut self) -> RequestOutput {
        match &mut self.command {
            Command::ReadRequest { output, .. } | Command::Read { output, .. } => {
                RequestOutput::Read(output.assemble())
            }
            Command::ReadBatch { results, .. } => RequestOutput::ReadBatch(
                results.iter_mut().map(|slot| slot.take().unwrap_or_default()).collect(),
            ),
            Command::FileExists { found, .. } => RequestOutput::Exists(found.unwrap_or(false)),
            Command::FileMetadata { size, .. } => match size {
                Some(size) => RequestOutput::FileSize(*size),
                None => RequestOutput::None,
            },
            Command::Report { statistics } => {
                RequestOutput::Statistics(std::mem::take(statistics))
            }
            Command::Custom { payload } => match payload.take() {
                Some(payload) => RequestOutput::Custom(payload),
                None => RequestOutput::None,
            },
            _ => RequestOutput::None,
        }
    }

    fn discard_output(&mut self) {
        match &mut self.command {
            Command::ReadRequest { output, .. } | Command::Read { output, .. } => output.clear(),
            Command::ReadBatch { results, .. } => results.iter_mut().for_each(|slot| *slot = None),
            Command::Custom { payload } => *payload = None,
            _ => {}
        }
    }

    /// 将子请求的结果并入本请求，并递减未完成子请求计数。
    ///
    /// - 读取数据按子请求在文件中的偏移登记，批量读取按槽位回填；
    /// - 首个失败被保留，任一子请求取消都会使父请求最终取消。
    pub(crate) fn absorb_child(
        &mut self,
        child_offset: u64,
        batch_slot: Option<usize>,
        child: &CompletedRequest,
    ) {
        self.pending_children = self.pending_children.saturating_sub(1);
        match child.status {
            RequestStatus::Failed => {
                if let Some(failure) = &child.failure {
                    self.set_failure(failure.clone());
                }
            }
            RequestStatus::Canceled => self.child_canceled = true,
            _ => {}
        }

        let Some(data) = child.data() else {
            return;
        };
        match &mut self.command {
            Command::ReadRequest { output, .. } | Command::Read { output, .. } => {
                output.push_chunk(child_offset, data.clone());
            }
            Command::ReadBatch { results, .. } => {
                if let Some(slot) = batch_slot.and_then(|slot| results.get_mut(slot)) {
                    *slot = Some(data.clone());
                }
            }
            _ => {}
        }
    }

    /// 已缓存的读取字节数，计入上下文的 `buffered_bytes` 统计。
    pub(crate) fn bytes_buffered(&self) -> usize {
        match &self.command {
            Command::ReadRequest { output, .. } | Command::Read { output, .. } => {
                output.bytes_buffered()
            }
            _ => 0,
        }
    }

    pub(crate) fn push_read_data(&mut self, data: Bytes) {
        if let Command::Read { offset, output, .. } = &mut self.command {
            output.push_chunk(*offset, data);
        }
    }
}

impl fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRequest")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("deadline", &self.deadline)
            .field("parent", &self.parent)
            .field("pending_children", &self.pending_children)
            .field("has_callback", &self.callback.is_some())
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}
