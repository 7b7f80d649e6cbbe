//! # StreamerContext
//!
//! ## 角色定位（Why）
//! - 持有所有请求对象：内部请求与外部请求各自一个 arena，回收后进入各自的回收站复用，进程运行期间从不单独释放；
//! - 维护完成队列与驱动线程的休眠/唤醒条件，是调用方线程与驱动线程之间唯一的交汇点。
//!
//! ## 线程划分（What）
//! - [`StreamerContext`] 由驱动线程独占（`&mut`），内部回收站、已准备队列、arena 访问均无锁；
//! - [`ContextHandle`] 可克隆、可跨线程共享，只暴露线程安全子集：外部请求分配（互斥锁）、
//!   提交、完成标记（可重入锁）、唤醒与挂起；
//! - 完成队列中的请求绝不会同时出现在回收站中：回收前会检查队列成员关系。
//!
//! ## 回收握手（How）
//! - 终结时先取出回调并在驱动线程上调用，回调返回后才回收槽位；
//! - 回收递增代际号，旧的 [`RequestId`] 随即失效，任何层持有的过期标识在查找时返回 `None`。

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, error, warn};

use crate::{
    error::{RequestFailure, Result, StreamerError},
    request::{
        Command, CompletedRequest, FileRequest, RequestId, RequestStatus, RequestUsage,
    },
    statistics::{AverageWindow, Statistic},
    sync::{AtomicBool, CompletionLock, Mutex, Ordering, WakeSignal},
};

const OWNER: &str = "context";
const LATENCY_WINDOW: usize = 64;

struct Slot {
    generation: u32,
    live: bool,
    request: FileRequest,
}

impl Slot {
    fn vacant(usage: RequestUsage, index: u32) -> Self {
        Self {
            generation: 0,
            live: false,
            request: FileRequest::new(RequestId::new(usage, index, 0)),
        }
    }
}

struct ExternalBin {
    /// `(索引, 下一次分配使用的代际号)`。
    free: Vec<(u32, u32)>,
    next_index: u32,
    outstanding: usize,
    limit: Option<usize>,
}

struct Submissions {
    requests: Vec<FileRequest>,
    closed: bool,
}

/// 调用方线程与驱动线程共享的状态。
pub(crate) struct SharedContext {
    external_bin: Mutex<ExternalBin>,
    completed: CompletionLock<VecDeque<RequestId>>,
    submissions: Mutex<Submissions>,
    wake: WakeSignal,
    suspended: AtomicBool,
    shutdown: AtomicBool,
}

impl SharedContext {
    fn new(max_external_requests: Option<usize>) -> Self {
        Self {
            external_bin: Mutex::new(ExternalBin {
                free: Vec::new(),
                next_index: 0,
                outstanding: 0,
                limit: max_external_requests,
            }),
            completed: CompletionLock::new(VecDeque::new()),
            submissions: Mutex::new(Submissions {
                requests: Vec::new(),
                closed: false,
            }),
            wake: WakeSignal::new(),
            suspended: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    fn reserve_external(self: &Arc<Self>) -> Result<FileRequest> {
        let mut bin = self.external_bin.lock();
        if let Some(limit) = bin.limit
            && bin.outstanding >= limit
        {
            drop(bin);
            error!(limit, "external request allocator exhausted");
            return Err(StreamerError::AllocatorExhausted { limit });
        }

        let (index, generation) = match bin.free.pop() {
            Some(entry) => entry,
            None => {
                let index = bin.next_index;
                let Some(next) = index.checked_add(1) else {
                    drop(bin);
                    error!("external request index space exhausted");
                    return Err(StreamerError::AllocatorExhausted {
                        limit: u32::MAX as usize,
                    });
                };
                bin.next_index = next;
                (index, 0)
            }
        };
        bin.outstanding += 1;
        drop(bin);

        let id = RequestId::new(RequestUsage::External, index, generation);
        let reservation = ExternalReservation {
            shared: Arc::clone(self),
            index,
            generation,
            armed: true,
        };
        Ok(FileRequest::with_reservation(id, reservation))
    }

    fn release_external(&self, index: u32, next_generation: u32) {
        let mut bin = self.external_bin.lock();
        bin.free.push((index, next_generation));
        bin.outstanding = bin.outstanding.saturating_sub(1);
    }

    fn outstanding_external(&self) -> usize {
        self.external_bin.lock().outstanding
    }

    fn push_submission(&self, mut request: FileRequest) -> Result<RequestId> {
        let id = request.id();
        {
            let mut submissions = self.submissions.lock();
            if submissions.closed {
                // 请求在此处被丢弃，预留的外部槽位随 Drop 归还。
                return Err(StreamerError::ShuttingDown);
            }
            if let Some(reservation) = request.take_reservation() {
                reservation.consume();
            }
            submissions.requests.push(request);
        }
        self.wake_up();
        Ok(id)
    }

    fn take_submissions(&self) -> Vec<FileRequest> {
        std::mem::take(&mut self.submissions.lock().requests)
    }

    fn has_submissions(&self) -> bool {
        !self.submissions.lock().requests.is_empty()
    }

    /// 关闭提交入口并取出尚未被驱动线程接收的请求。
    fn close_submissions(&self) -> Vec<FileRequest> {
        let mut submissions = self.submissions.lock();
        submissions.closed = true;
        std::mem::take(&mut submissions.requests)
    }

    /// 同一标识在队列中至多出现一次。
    fn mark_completed(&self, id: RequestId) {
        self.completed.with(|queue| {
            if !queue.contains(&id) {
                queue.push_back(id);
            }
        });
    }

    /// 每次只在锁内取出一个标识，回调执行期间不持有完成队列的锁。
    fn pop_completed(&self) -> Option<RequestId> {
        self.completed.with(VecDeque::pop_front)
    }

    fn forget_completed(&self, id: RequestId) {
        self.completed
            .with(|queue| queue.retain(|queued| *queued != id));
    }

    fn is_completion_queued(&self, id: RequestId) -> bool {
        self.completed.with(|queue| queue.contains(&id))
    }

    fn completion_queue_len(&self) -> usize {
        self.completed.with(|queue| queue.len())
    }

    fn wake_up(&self) {
        self.wake.wake();
    }

    fn wait_for_wake(&self, timeout: Duration) -> bool {
        self.wake.wait(timeout)
    }
}

/// 外部请求在提交前持有的槽位预留。未提交即被丢弃时自动归还槽位并使旧标识失效。
pub(crate) struct ExternalReservation {
    shared: Arc<SharedContext>,
    index: u32,
    generation: u32,
    armed: bool,
}

impl ExternalReservation {
    fn consume(mut self) {
        self.armed = false;
    }
}

impl Drop for ExternalReservation {
    fn drop(&mut self) {
        if self.armed {
            self.shared
                .release_external(self.index, self.generation.wrapping_add(1));
        }
    }
}

/// 上下文的线程安全视图。
#[derive(Clone)]
pub struct ContextHandle {
    shared: Arc<SharedContext>,
}

impl ContextHandle {
    /// 申请一个外部请求。任意线程可调用。
    ///
    /// # 错误
    /// 已达到 `max_external_requests` 上限时返回 [`StreamerError::AllocatorExhausted`]，
    /// 此时不会产生任何悬垂句柄。
    pub fn get_new_external_request(&self) -> Result<FileRequest> {
        self.shared.reserve_external()
    }

    /// 提交已配置好的请求并唤醒驱动线程，返回用于取消或重排的标识。
    pub fn queue_request(&self, request: FileRequest) -> Result<RequestId> {
        self.shared.push_submission(request)
    }

    /// 将已进入终态的请求放入完成队列并唤醒驱动线程。
    ///
    /// 只有终态请求会被终结；尚未执行完的请求与过期标识在出队时被忽略，
    /// 之后由栈正常完成时再次入队。
    pub fn mark_request_as_completed(&self, id: RequestId) {
        self.shared.mark_completed(id);
        self.shared.wake_up();
    }

    /// 唤醒驱动线程；已处于唤醒状态时无操作。可在回调中调用。
    pub fn wake_up_main_stream_thread(&self) {
        self.shared.wake_up();
    }

    /// 暂停向栈派发新的数据请求，已在栈内的请求继续执行。
    pub fn suspend_processing(&self) {
        self.shared.suspended.store(true, Ordering::Release);
    }

    pub fn resume_processing(&self) {
        self.shared.suspended.store(false, Ordering::Release);
        self.shared.wake_up();
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_up();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// 已分配但尚未回收的外部请求数量。
    pub fn outstanding_external_requests(&self) -> usize {
        self.shared.outstanding_external()
    }
}

#[derive(Default)]
struct FinalizeStatistics {
    completed: u64,
    failed: u64,
    canceled: u64,
    missed_deadlines: u64,
    latency_us: AverageWindow<LATENCY_WINDOW>,
}

/// 驱动线程独占的请求上下文。
pub struct StreamerContext {
    internal: Vec<Slot>,
    internal_bin: Vec<u32>,
    external: Vec<Slot>,
    prepared: Vec<RequestId>,
    stats: FinalizeStatistics,
    shared: Arc<SharedContext>,
}

impl StreamerContext {
    /// `max_external_requests` 为 `None` 时外部请求数量不设上限。
    pub fn new(max_external_requests: Option<usize>) -> Self {
        Self {
            internal: Vec::new(),
            internal_bin: Vec::new(),
            external: Vec::new(),
            prepared: Vec::new(),
            stats: FinalizeStatistics::default(),
            shared: Arc::new(SharedContext::new(max_external_requests)),
        }
    }

    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 分配内部请求，优先复用内部回收站。仅驱动线程调用，无锁。
    pub fn get_new_internal_request(&mut self) -> Result<RequestId> {
        if let Some(index) = self.internal_bin.pop() {
            let slot = &mut self.internal[index as usize];
            slot.live = true;
            return Ok(RequestId::new(RequestUsage::Internal, index, slot.generation));
        }

        let Ok(index) = u32::try_from(self.internal.len()) else {
            error!("internal request index space exhausted");
            return Err(StreamerError::AllocatorExhausted {
                limit: u32::MAX as usize,
            });
        };
        let mut slot = Slot::vacant(RequestUsage::Internal, index);
        slot.live = true;
        self.internal.push(slot);
        Ok(RequestId::new(RequestUsage::Internal, index, 0))
    }

    /// 将调用方提交的外部请求放入 arena。
    pub(crate) fn install_external(&mut self, mut request: FileRequest) -> RequestId {
        let id = request.id();
        let index = id.index() as usize;
        while self.external.len() <= index {
            let next = self.external.len() as u32;
            self.external.push(Slot::vacant(RequestUsage::External, next));
        }

        request.mark_queued(Instant::now());
        let slot = &mut self.external[index];
        debug_assert!(!slot.live, "external slot {id} installed twice");
        slot.generation = id.generation();
        slot.live = true;
        slot.request = request;
        id
    }

    /// 接收调用方提交的全部请求，按提交顺序返回其标识。
    pub fn accept_submissions(&mut self) -> Vec<RequestId> {
        let batch = self.shared.take_submissions();
        batch
            .into_iter()
            .map(|request| self.install_external(request))
            .collect()
    }

    pub(crate) fn has_submissions(&self) -> bool {
        self.shared.has_submissions()
    }

    pub(crate) fn close_submissions(&mut self) -> Vec<RequestId> {
        let batch = self.shared.close_submissions();
        batch
            .into_iter()
            .map(|request| self.install_external(request))
            .collect()
    }

    /// 阻塞直到被唤醒或 `timeout` 到期，返回是否由唤醒结束等待。
    ///
    /// 唤醒标志在被消费前一直有效，等待开始前到达的唤醒不会丢失。
    pub fn wait_for_wake(&self, timeout: Duration) -> bool {
        self.shared.wait_for_wake(timeout)
    }

    fn slot(&self, id: RequestId) -> Option<&Slot> {
        let slots = match id.usage() {
            RequestUsage::Internal => &self.internal,
            RequestUsage::External => &self.external,
        };
        slots
            .get(id.index() as usize)
            .filter(|slot| slot.live && slot.generation == id.generation())
    }

    fn slot_mut(&mut self, id: RequestId) -> Option<&mut Slot> {
        let slots = match id.usage() {
            RequestUsage::Internal => &mut self.internal,
            RequestUsage::External => &mut self.external,
        };
        slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.live && slot.generation == id.generation())
    }

    /// 按标识查找存活请求；已回收或代际号不匹配时返回 `None`。
    pub fn request(&self, id: RequestId) -> Option<&FileRequest> {
        self.slot(id).map(|slot| &slot.request)
    }

    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut FileRequest> {
        self.slot_mut(id).map(|slot| &mut slot.request)
    }

    pub fn is_live(&self, id: RequestId) -> bool {
        self.slot(id).is_some()
    }

    /// 派生一个内部子请求：继承父请求的截止时间与优先级，并建立父子链接。
    pub fn create_child(&mut self, parent: RequestId, command: Command) -> Result<RequestId> {
        let Some((deadline, priority)) = self
            .request(parent)
            .map(|request| (request.deadline(), request.priority()))
        else {
            return Err(StreamerError::StaleRequest { id: parent });
        };

        let child = self.get_new_internal_request()?;
        if let Some(request) = self.request_mut(child) {
            *request.command_mut() = command;
            request.set_schedule(deadline, priority);
        }
        self.link_child(parent, child)?;
        Ok(child)
    }

    /// 建立父子链接，父请求在所有子请求终结前不会终结，也不可回收。
    pub fn link_child(&mut self, parent: RequestId, child: RequestId) -> Result<()> {
        if !self.is_live(child) {
            return Err(StreamerError::StaleRequest { id: child });
        }
        let Some(parent_request) = self.request_mut(parent) else {
            return Err(StreamerError::StaleRequest { id: parent });
        };
        parent_request.add_pending_child();
        if let Some(child_request) = self.request_mut(child) {
            child_request.set_parent(parent);
        }
        Ok(())
    }

    /// `target` 是否为 `id` 的祖先（不含自身）。
    pub fn has_ancestor(&self, id: RequestId, target: RequestId) -> bool {
        let mut cursor = self.request(id).and_then(FileRequest::parent);
        while let Some(current) = cursor {
            if current == target {
                return true;
            }
            cursor = self.request(current).and_then(FileRequest::parent);
        }
        false
    }

    /// `id` 是否为 `target` 本身或其后代。
    pub fn is_same_or_descendant(&self, id: RequestId, target: RequestId) -> bool {
        id == target || self.has_ancestor(id, target)
    }

    pub fn push_prepared_request(&mut self, id: RequestId) {
        self.prepared.push(id);
    }

    pub fn take_prepared_requests(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.prepared)
    }

    /// 放回未能派发的已准备请求，保持在新到达的请求之前。
    pub fn restore_prepared_requests(&mut self, mut remaining: Vec<RequestId>) {
        remaining.append(&mut self.prepared);
        self.prepared = remaining;
    }

    pub fn prepared_requests(&self) -> &[RequestId] {
        &self.prepared
    }

    /// `Pending → Processing`。
    pub fn start_processing(&mut self, id: RequestId) -> bool {
        match self.request_mut(id) {
            Some(request) => request.set_status(RequestStatus::Processing).is_ok(),
            None => false,
        }
    }

    pub fn complete(&mut self, id: RequestId) -> bool {
        self.finish(id, RequestStatus::Completed, None)
    }

    pub fn fail(&mut self, id: RequestId, failure: RequestFailure) -> bool {
        self.finish(id, RequestStatus::Failed, Some(failure))
    }

    pub fn cancel(&mut self, id: RequestId) -> bool {
        self.finish(id, RequestStatus::Canceled, None)
    }

    /// 迁移到终态并放入完成队列。返回迁移是否生效。
    fn finish(
        &mut self,
        id: RequestId,
        status: RequestStatus,
        failure: Option<RequestFailure>,
    ) -> bool {
        let Some(request) = self.request_mut(id) else {
            debug!(%id, %status, "ignoring completion of a stale request");
            return false;
        };
        if let Err(err) = request.set_status(status) {
            debug!(%id, error = %err, "ignoring completion of a finished request");
            return false;
        }
        if let Some(failure) = failure {
            debug!(%id, code = failure.kind().code(), detail = failure.detail(), "request failed");
            request.set_failure(failure);
        }
        self.mark_request_as_completed(id);
        true
    }

    /// 放入完成队列（FIFO）。
    pub fn mark_request_as_completed(&self, id: RequestId) {
        self.shared.mark_completed(id);
    }

    pub fn has_requests_to_finalize(&self) -> bool {
        self.shared.completion_queue_len() > 0
    }

    /// 清空本轮之前的完成时间预估。
    pub(crate) fn clear_estimates(&mut self) {
        for slot in self.internal.iter_mut().chain(self.external.iter_mut()) {
            if slot.live {
                slot.request.set_estimated_completion(None);
            }
        }
    }

    /// 记录预计完成时间，并把较晚的时间向所有祖先传播。
    pub fn set_estimated_completion(&mut self, id: RequestId, at: Instant) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(request) = self.request_mut(current) else {
                break;
            };
            let merged = request
                .estimated_completion()
                .map_or(at, |existing| existing.max(at));
            request.set_estimated_completion(Some(merged));
            cursor = request.parent();
        }
    }

    /// 依次终结完成队列中的请求：调用回调、并入父请求、回收。
    ///
    /// 回调可以提交新请求或标记其他请求完成；本轮新加入队列的请求在同一次调用中被处理。
    /// 返回是否终结了至少一个请求。
    pub fn finalize_completed_requests(&mut self) -> bool {
        let mut finalized = false;
        while let Some(id) = self.shared.pop_completed() {
            finalized |= self.finalize_one(id);
        }
        finalized
    }

    fn finalize_one(&mut self, id: RequestId) -> bool {
        let now = Instant::now();
        let Some(request) = self.request_mut(id) else {
            warn!(%id, "skipping finalization of a stale request");
            return false;
        };
        if request.pending_children() > 0 {
            // 最后一个子请求终结时会重新入队。
            return false;
        }
        if !request.status().is_terminal() {
            debug!(%id, status = %request.status(), "ignoring completion mark of an unfinished request");
            return false;
        }

        let (offset, batch_slot) = match request.command() {
            Command::Read {
                offset, batch_slot, ..
            } => (*offset, *batch_slot),
            other => (other.offset(), None),
        };
        let completed = request.take_completion();
        let callback = request.take_callback();
        let parent = request.parent();
        let queued_at = request.queued_at();
        let deadline = request.deadline();

        self.record_finalized(&completed, queued_at, deadline, now);
        if let Some(parent) = parent {
            self.absorb_into_parent(parent, offset, batch_slot, &completed);
        }

        if let Some(callback) = callback
            && panic::catch_unwind(AssertUnwindSafe(move || callback(completed))).is_err()
        {
            error!(%id, "request completion callback panicked");
        }
        // 回调可能再次标记自身。
        self.shared.forget_completed(id);

        if let Err(err) = self.recycle_request(id) {
            warn!(%id, error = %err, "finalized request could not be recycled");
        }
        true
    }

    fn absorb_into_parent(
        &mut self,
        parent: RequestId,
        offset: u64,
        batch_slot: Option<usize>,
        child: &CompletedRequest,
    ) {
        let Some(request) = self.request_mut(parent) else {
            debug!(%parent, child = %child.id, "parent of finalized request is gone");
            return;
        };
        request.absorb_child(offset, batch_slot, child);
        if request.pending_children() > 0 {
            return;
        }

        if request.status().is_terminal() {
            // 父请求先于子请求进入终态，终结被推迟到此刻。
            self.mark_request_as_completed(parent);
            return;
        }
        let status = if request.child_canceled() {
            RequestStatus::Canceled
        } else if request.failure().is_some() {
            RequestStatus::Failed
        } else {
            RequestStatus::Completed
        };
        self.finish(parent, status, None);
    }

    fn record_finalized(
        &mut self,
        completed: &CompletedRequest,
        queued_at: Option<Instant>,
        deadline: Option<Instant>,
        now: Instant,
    ) {
        match completed.status {
            RequestStatus::Completed => self.stats.completed += 1,
            RequestStatus::Failed => self.stats.failed += 1,
            RequestStatus::Canceled => self.stats.canceled += 1,
            RequestStatus::Pending | RequestStatus::Processing => {}
        }
        if let Some(queued_at) = queued_at {
            let elapsed = now.saturating_duration_since(queued_at);
            self.stats
                .latency_us
                .push(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
        }
        if let Some(deadline) = deadline
            && now > deadline
        {
            self.stats.missed_deadlines += 1;
            debug!(
                id = %completed.id,
                late_by_us = now.saturating_duration_since(deadline).as_micros() as u64,
                "request finished after its deadline"
            );
        }
    }

    /// 将请求归还到与其来源匹配的回收站。
    ///
    /// # 错误
    /// - 标识已过期：[`StreamerError::StaleRequest`]；
    /// - 仍有未终结的子请求、仍挂在未终结的父请求下、回调尚未触发、或仍在完成队列中：
    ///   [`StreamerError::RecycleRejected`]。
    pub fn recycle_request(&mut self, id: RequestId) -> Result<()> {
        let queued = self.shared.is_completion_queued(id);
        let parent_pending = self
            .request(id)
            .and_then(FileRequest::parent)
            .and_then(|parent| self.request(parent))
            .is_some_and(|parent| !parent.status().is_terminal() || parent.pending_children() > 0);

        let slots = match id.usage() {
            RequestUsage::Internal => &mut self.internal,
            RequestUsage::External => &mut self.external,
        };
        let Some(slot) = slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.live && slot.generation == id.generation())
        else {
            return Err(StreamerError::StaleRequest { id });
        };

        let reason = if slot.request.pending_children() > 0 {
            Some("child requests are still outstanding")
        } else if slot.request.has_callback() {
            Some("completion callback has not been invoked")
        } else if queued {
            Some("request is still in the completion queue")
        } else if parent_pending && !slot.request.status().is_terminal() {
            Some("parent request is still waiting for it")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(StreamerError::RecycleRejected { id, reason });
        }

        let next_generation = slot.generation.wrapping_add(1);
        slot.generation = next_generation;
        slot.live = false;
        slot.request
            .reset(RequestId::new(id.usage(), id.index(), next_generation));
        match id.usage() {
            RequestUsage::Internal => self.internal_bin.push(id.index()),
            RequestUsage::External => self.shared.release_external(id.index(), next_generation),
        }
        Ok(())
    }

    /// 存活请求（内部 + 外部）的数量。
    pub fn live_request_count(&self) -> usize {
        self.internal
            .iter()
            .chain(self.external.iter())
            .filter(|slot| slot.live)
            .count()
    }

    /// 所有存活请求的标识。
    pub fn live_request_ids(&self) -> Vec<RequestId> {
        self.internal
            .iter()
            .chain(self.external.iter())
            .filter(|slot| slot.live)
            .map(|slot| slot.request.id())
            .collect()
    }

    pub fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        let stats = &self.stats;
        out.push(Statistic::count(OWNER, "internal_capacity", self.internal.len() as u64));
        out.push(Statistic::count(OWNER, "internal_free", self.internal_bin.len() as u64));
        out.push(Statistic::count(OWNER, "external_capacity", self.external.len() as u64));
        out.push(Statistic::count(
            OWNER,
            "external_outstanding",
            self.shared.outstanding_external() as u64,
        ));
        out.push(Statistic::count(OWNER, "prepared", self.prepared.len() as u64));
        let buffered: usize = self
            .internal
            .iter()
            .chain(self.external.iter())
            .filter(|slot| slot.live)
            .map(|slot| slot.request.bytes_buffered())
            .sum();
        out.push(Statistic::count(OWNER, "buffered_bytes", buffered as u64));
        out.push(Statistic::count(
            OWNER,
            "completion_queue",
            self.shared.completion_queue_len() as u64,
        ));
        out.push(Statistic::count(OWNER, "completed", stats.completed));
        out.push(Statistic::count(OWNER, "failed", stats.failed));
        out.push(Statistic::count(OWNER, "canceled", stats.canceled));
        out.push(Statistic::count(OWNER, "missed_deadlines", stats.missed_deadlines));
        out.push(Statistic::float(
            OWNER,
            "average_latency_us",
            stats.latency_us.average(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::FailureKind, request::RequestOutput};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn internal_requests_are_reused_with_new_generation() {
        let mut ctx = StreamerContext::new(None);
        let first = ctx.get_new_internal_request().expect("allocate");
        ctx.recycle_request(first).expect("recycle idle request");

        let second = ctx.get_new_internal_request().expect("allocate");
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(ctx.request(first).is_none());
        assert!(matches!(
            ctx.recycle_request(first),
            Err(StreamerError::StaleRequest { .. })
        ));
    }

    #[test]
    fn external_allocation_respects_limit() {
        let ctx = StreamerContext::new(Some(2));
        let handle = ctx.handle();
        let a = handle.get_new_external_request().expect("first");
        let _b = handle.get_new_external_request().expect("second");
        assert!(matches!(
            handle.get_new_external_request(),
            Err(StreamerError::AllocatorExhausted { limit: 2 })
        ));

        let stale = a.id();
        drop(a);
        assert_eq!(handle.outstanding_external_requests(), 1);
        let c = handle.get_new_external_request().expect("slot returned on drop");
        assert_eq!(c.id().index(), stale.index());
        assert_ne!(c.id(), stale);
    }

    #[test]
    fn callback_runs_once_before_recycle() {
        let mut ctx = StreamerContext::new(None);
        let handle = ctx.handle();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut request = handle.get_new_external_request().expect("allocate");
        let counter = Arc::clone(&calls);
        request
            .create_file_exists("a.bin")
            .set_completion_callback(move |done| {
                assert_eq!(done.status, RequestStatus::Completed);
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let id = handle.queue_request(request).expect("queue");
        assert_eq!(ctx.accept_submissions(), vec![id]);

        assert!(matches!(
            ctx.recycle_request(id),
            Err(StreamerError::RecycleRejected { .. })
        ));
        assert!(ctx.complete(id));
        assert!(!ctx.complete(id), "second completion is ignored");
        assert!(ctx.has_requests_to_finalize());
        assert!(ctx.finalize_completed_requests());
        assert!(!ctx.has_requests_to_finalize());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!ctx.is_live(id));
        assert_eq!(handle.outstanding_external_requests(), 0);
    }

    #[test]
    fn parent_resolves_after_children_and_rejects_early_recycle() {
        let mut ctx = StreamerContext::new(None);
        let parent = ctx.get_new_internal_request().expect("parent");
        ctx.request_mut(parent)
            .expect("live")
            .create_read("data.bin", 0, 8);
        let left = ctx
            .create_child(
                parent,
                Command::Read {
                    path: "data.bin".into(),
                    offset: 0,
                    size: 4,
                    output: Default::default(),
                    batch_slot: None,
                },
            )
            .expect("left");
        let right = ctx
            .create_child(
                parent,
                Command::Read {
                    path: "data.bin".into(),
                    offset: 4,
                    size: 4,
                    output: Default::default(),
                    batch_slot: None,
                },
            )
            .expect("right");
        assert!(ctx.has_ancestor(right, parent));
        assert!(matches!(
            ctx.recycle_request(parent),
            Err(StreamerError::RecycleRejected { .. })
        ));

        let captured = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        ctx.request_mut(parent)
            .expect("live")
            .set_completion_callback(move |done| *sink.lock() = Some(done));

        ctx.request_mut(right)
            .expect("live")
            .push_read_data(bytes::Bytes::from_static(b"5678"));
        let mut stats = Vec::new();
        ctx.collect_statistics(&mut stats);
        assert_eq!(
            crate::statistics::find(&stats, OWNER, "buffered_bytes").map(Statistic::value),
            Some(crate::statistics::StatisticValue::Integer(4))
        );
        ctx.complete(right);
        ctx.request_mut(left)
            .expect("live")
            .push_read_data(bytes::Bytes::from_static(b"1234"));
        ctx.complete(left);

        assert!(ctx.finalize_completed_requests());
        let done = captured.lock().take().expect("parent callback");
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.data().map(|data| &data[..]), Some(&b"12345678"[..]));
        assert_eq!(ctx.live_request_count(), 0);
    }

    #[test]
    fn failed_child_fails_parent_with_detail() {
        let mut ctx = StreamerContext::new(None);
        let parent = ctx.get_new_internal_request().expect("parent");
        let child = ctx
            .create_child(parent, Command::FlushAll)
            .expect("child");
        ctx.fail(
            child,
            RequestFailure::new(FailureKind::DeviceBusy, "controller reset"),
        );

        let captured = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        ctx.request_mut(parent)
            .expect("live")
            .set_completion_callback(move |done| *sink.lock() = Some(done));
        ctx.finalize_completed_requests();

        let done = captured.lock().take().expect("parent finalized");
        assert_eq!(done.status, RequestStatus::Failed);
        assert!(matches!(done.output, RequestOutput::None));
        assert_eq!(
            done.failure.map(|failure| failure.kind()),
            Some(FailureKind::DeviceBusy)
        );
    }

    #[test]
    fn panicking_callback_does_not_poison_finalization() {
        let mut ctx = StreamerContext::new(None);
        let first = ctx.get_new_internal_request().expect("first");
        let second = ctx.get_new_internal_request().expect("second");
        ctx.request_mut(first)
            .expect("live")
            .set_completion_callback(|_| panic!("callback failure"));
        let reached = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reached);
        ctx.request_mut(second)
            .expect("live")
            .set_completion_callback(move |_| flag.store(true, Ordering::SeqCst));

        ctx.complete(first);
        ctx.complete(second);
        ctx.finalize_completed_requests();
        assert!(reached.load(Ordering::SeqCst));
        assert_eq!(ctx.live_request_count(), 0);
    }

    #[test]
    fn external_mark_does_not_finish_unexecuted_request() {
        let mut ctx = StreamerContext::new(None);
        let handle = ctx.handle();
        let mut request = handle.get_new_external_request().expect("allocate");
        request.create_file_exists("queued.bin");
        let id = handle.queue_request(request).expect("queue");
        ctx.accept_submissions();

        handle.mark_request_as_completed(id);
        handle.mark_request_as_completed(id);
        assert!(!ctx.finalize_completed_requests());
        assert!(!ctx.has_requests_to_finalize());
        assert_eq!(
            ctx.request(id).map(FileRequest::status),
            Some(RequestStatus::Pending)
        );

        ctx.complete(id);
        handle.mark_request_as_completed(id);
        assert!(ctx.finalize_completed_requests());
        assert!(!ctx.is_live(id));
    }

    #[test]
    fn closed_submissions_reject_and_release_slots() {
        let mut ctx = StreamerContext::new(Some(1));
        let handle = ctx.handle();
        assert!(ctx.close_submissions().is_empty());

        let request = handle.get_new_external_request().expect("allocate");
        assert!(matches!(
            handle.queue_request(request),
            Err(StreamerError::ShuttingDown)
        ));
        assert_eq!(handle.outstanding_external_requests(), 0);
    }

    #[test]
    fn wake_is_sticky_until_consumed() {
        let ctx = StreamerContext::new(None);
        let handle = ctx.handle();
        handle.wake_up_main_stream_thread();
        handle.wake_up_main_stream_thread();
        assert!(ctx.wait_for_wake(Duration::from_secs(5)));
        assert!(!ctx.wait_for_wake(Duration::from_millis(1)));
    }
}
