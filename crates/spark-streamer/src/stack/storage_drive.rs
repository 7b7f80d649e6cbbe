//! 栈底的存储驱动层。
//!
//! # 契约说明（What）
//! - 句柄缓存：按需打开，数量达到 `max_file_handles` 时淘汰最久未使用的句柄；`flush_*` 与 Drop 关闭句柄，
//!   之后排队的请求会透明地重新打开文件；
//! - 待执行队列为 FIFO；命中“活动句柄 + 活动偏移”的顺序读取插到队首；
//! - 可用槽位 = `max_concurrent_requests - 待执行数`，饱和到零；
//! - `offset + size` 超出文件长度的读取直接以 `ShortRead` 失败，不发起物理读取；设备返回字节不足同样失败。
//!
//! # 实现细节（How）
//! - 缓存是线性扫描的小数组，最近使用时间取自单调递增的逻辑时钟，淘汰结果与墙钟无关；
//! - 打开/关闭耗时、读取耗时与读取大小分别记录在固定窗口的滚动平均中，用于完成时间预估与统计。

use std::{
    collections::VecDeque,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tracing::debug;

use super::{StackEntryBase, StreamStackEntry, spawn_children};
use crate::{
    context::StreamerContext,
    error::{FailureKind, RequestFailure},
    fs::{FileHandle, FileSystem},
    path::RequestPath,
    request::{Command, ReadOutput, RequestId},
    statistics::{AverageWindow, Statistic},
};

const TIMING_WINDOW: usize = 32;

struct CachedHandle {
    path: RequestPath,
    last_used: u64,
    handle: Box<dyn FileHandle>,
}

#[derive(Default)]
struct DriveCounters {
    opens: u64,
    evictions: u64,
    reads: u64,
    failed_requests: u64,
    sequential_reads: u64,
    bytes_read: u64,
}

pub struct StorageDrive {
    base: StackEntryBase,
    fs: Arc<dyn FileSystem>,
    cache: Vec<CachedHandle>,
    max_file_handles: usize,
    max_concurrent_requests: usize,
    active_slot: Option<usize>,
    active_offset: u64,
    pending: VecDeque<RequestId>,
    access_clock: u64,
    open_time_us: AverageWindow<TIMING_WINDOW>,
    close_time_us: AverageWindow<TIMING_WINDOW>,
    read_time_us: AverageWindow<TIMING_WINDOW>,
    read_size: AverageWindow<TIMING_WINDOW>,
    counters: DriveCounters,
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

impl StorageDrive {
    /// `max_file_handles` 与 `max_concurrent_requests` 小于 1 时按 1 处理。
    pub fn new(
        fs: Arc<dyn FileSystem>,
        max_file_handles: usize,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            base: StackEntryBase::new("storage_drive"),
            fs,
            cache: Vec::new(),
            max_file_handles: max_file_handles.max(1),
            max_concurrent_requests: max_concurrent_requests.max(1),
            active_slot: None,
            active_offset: 0,
            pending: VecDeque::new(),
            access_clock: 0,
            open_time_us: AverageWindow::new(),
            close_time_us: AverageWindow::new(),
            read_time_us: AverageWindow::new(),
            read_size: AverageWindow::new(),
            counters: DriveCounters::default(),
        }
    }

    /// 当前缓存的路径，按槽位顺序。
    pub fn cached_paths(&self) -> Vec<RequestPath> {
        self.cache.iter().map(|entry| entry.path.clone()).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 线性扫描句柄缓存。
    fn find_file_in_cache(&self, path: &RequestPath) -> Option<usize> {
        self.cache.iter().position(|entry| entry.path == *path)
    }

    fn touch(&mut self, slot: usize) {
        self.access_clock += 1;
        self.cache[slot].last_used = self.access_clock;
    }

    fn is_sequential(&self, path: &RequestPath, offset: u64) -> bool {
        self.active_slot
            .and_then(|slot| self.cache.get(slot))
            .is_some_and(|entry| entry.path == *path && self.active_offset == offset)
    }

    /// 返回 `path` 对应的缓存槽位，必要时打开文件并淘汰最久未使用的句柄。
    fn resolve_handle(&mut self, path: &RequestPath) -> io::Result<usize> {
        if let Some(slot) = self.active_slot
            && self.cache.get(slot).is_some_and(|entry| entry.path == *path)
        {
            self.touch(slot);
            return Ok(slot);
        }
        if let Some(slot) = self.find_file_in_cache(path) {
            self.touch(slot);
            return Ok(slot);
        }

        if self.cache.len() >= self.max_file_handles
            && let Some(victim) = self.least_recently_used()
        {
            let evicted = self.remove_slot(victim);
            self.counters.evictions += 1;
            debug!(path = %evicted.path, "evicting least recently used file handle");
            self.close_handle(evicted);
        }

        let started = Instant::now();
        let handle = self.fs.open(path)?;
        self.open_time_us.push(micros(started.elapsed()));
        self.counters.opens += 1;

        self.access_clock += 1;
        self.cache.push(CachedHandle {
            path: path.clone(),
            last_used: self.access_clock,
            handle,
        });
        Ok(self.cache.len() - 1)
    }

    fn least_recently_used(&self) -> Option<usize> {
        self.cache
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(slot, _)| slot)
    }

    /// 移除槽位并修正活动槽位（`swap_remove` 会把末尾元素挪到 `slot`）。
    fn remove_slot(&mut self, slot: usize) -> CachedHandle {
        let last = self.cache.len() - 1;
        let removed = self.cache.swap_remove(slot);
        self.active_slot = match self.active_slot {
            Some(active) if active == slot => None,
            Some(active) if active == last => Some(slot),
            other => other,
        };
        removed
    }

    fn close_handle(&mut self, entry: CachedHandle) {
        let started = Instant::now();
        drop(entry);
        self.close_time_us.push(micros(started.elapsed()));
    }

    fn fail(&mut self, ctx: &mut StreamerContext, id: RequestId, failure: RequestFailure) {
        self.counters.failed_requests += 1;
        ctx.fail(id, failure);
    }

    fn read_file(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        path: &RequestPath,
        offset: u64,
        size: u64,
    ) {
        let slot = match self.resolve_handle(path) {
            Ok(slot) => slot,
            Err(err) => return self.fail(ctx, id, RequestFailure::from_io(path, &err)),
        };
        let length = match self.cache[slot].handle.size() {
            Ok(length) => length,
            Err(err) => return self.fail(ctx, id, RequestFailure::from_io(path, &err)),
        };
        if offset.checked_add(size).is_none_or(|end| end > length) {
            let available = length.saturating_sub(offset);
            return self.fail(
                ctx,
                id,
                RequestFailure::short_read(path, offset, size, available),
            );
        }
        let Ok(len) = usize::try_from(size) else {
            return self.fail(
                ctx,
                id,
                RequestFailure::new(
                    FailureKind::ResourceExhausted,
                    format!("read of {size} bytes does not fit in memory"),
                ),
            );
        };

        let sequential = self.is_sequential(path, offset);
        let mut buffer = BytesMut::zeroed(len);
        let started = Instant::now();
        let result = self.cache[slot].handle.read_at(offset, &mut buffer);
        self.read_time_us.push(micros(started.elapsed()));
        self.counters.reads += 1;

        match result {
            Ok(read) if read == len => {
                self.read_size.push(size);
                self.counters.bytes_read += size;
                if sequential {
                    self.counters.sequential_reads += 1;
                }
                self.active_slot = Some(slot);
                self.active_offset = offset + size;
                if let Some(request) = ctx.request_mut(id) {
                    request.push_read_data(buffer.freeze());
                }
                ctx.complete(id);
            }
            Ok(read) => {
                self.active_slot = None;
                self.fail(
                    ctx,
                    id,
                    RequestFailure::short_read(path, offset, size, read as u64),
                );
            }
            Err(err) => {
                self.active_slot = None;
                self.fail(ctx, id, RequestFailure::from_io(path, &err));
            }
        }
    }

    fn file_exists(&mut self, ctx: &mut StreamerContext, id: RequestId, path: &RequestPath) {
        let found = if self.find_file_in_cache(path).is_some() {
            Ok(true)
        } else {
            self.fs.exists(path)
        };
        match found {
            Ok(found) => {
                if let Some(Command::FileExists { found: slot, .. }) =
                    ctx.request_mut(id).map(|request| request.command_mut())
                {
                    *slot = Some(found);
                }
                ctx.complete(id);
            }
            Err(err) => self.fail(ctx, id, RequestFailure::from_io(path, &err)),
        }
    }

    fn file_metadata(&mut self, ctx: &mut StreamerContext, id: RequestId, path: &RequestPath) {
        match self.lookup_size(path) {
            Ok(size) => {
                if let Some(Command::FileMetadata { size: slot, .. }) =
                    ctx.request_mut(id).map(|request| request.command_mut())
                {
                    *slot = Some(size);
                }
                ctx.complete(id);
            }
            Err(err) => self.fail(ctx, id, RequestFailure::from_io(path, &err)),
        }
    }

    fn lookup_size(&self, path: &RequestPath) -> io::Result<u64> {
        match self.find_file_in_cache(path) {
            Some(slot) => self.cache[slot].handle.size(),
            None => self.fs.file_size(path),
        }
    }

    /// 估算单个请求的设备耗时：未缓存时计入打开耗时，读取按平均吞吐折算。
    fn estimate_cost(&self, command: &Command) -> Duration {
        let open_cost = |path: &RequestPath| {
            if self.find_file_in_cache(path).is_some() {
                0.0
            } else {
                self.open_time_us.average()
            }
        };
        let micros = match command {
            Command::Read { path, size, .. } | Command::ReadRequest { path, size, .. } => {
                let average_size = self.read_size.average();
                let read_cost = if average_size > 0.0 {
                    *size as f64 / average_size * self.read_time_us.average()
                } else {
                    self.read_time_us.average()
                };
                open_cost(path) + read_cost
            }
            Command::FileExists { path, .. } | Command::FileMetadata { path, .. } => open_cost(path),
            _ => 0.0,
        };
        Duration::try_from_secs_f64(micros / 1_000_000.0).unwrap_or(Duration::ZERO)
    }
}

impl StreamStackEntry for StorageDrive {
    fn base(&self) -> &StackEntryBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackEntryBase {
        &mut self.base
    }

    /// 调用方读取转换为一个内部 `Read` 子请求；批量读取每项一个子请求，空批量立即完成。
    fn prepare_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let Some(request) = ctx.request(id) else {
            return;
        };
        let children: Vec<Command> = match request.command() {
            Command::ReadRequest {
                path, offset, size, ..
            } => vec![Command::Read {
                path: path.clone(),
                offset: *offset,
                size: *size,
                output: ReadOutput::default(),
                batch_slot: None,
            }],
            Command::ReadBatch { entries, .. } => entries
                .iter()
                .enumerate()
                .map(|(slot, entry)| Command::Read {
                    path: entry.path.clone(),
                    offset: entry.offset,
                    size: entry.size,
                    output: ReadOutput::default(),
                    batch_slot: Some(slot),
                })
                .collect(),
            _ => return ctx.push_prepared_request(id),
        };

        if children.is_empty() {
            ctx.complete(id);
            return;
        }
        spawn_children(ctx, id, children, StreamerContext::push_prepared_request);
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let Some(request) = ctx.request(id) else {
            return;
        };
        match request.command() {
            Command::Read { path, offset, .. } => {
                let sequential = self.is_sequential(path, *offset);
                ctx.start_processing(id);
                if sequential {
                    self.pending.push_front(id);
                } else {
                    self.pending.push_back(id);
                }
            }
            Command::FileExists { .. } | Command::FileMetadata { .. } | Command::Custom { .. } => {
                ctx.start_processing(id);
                self.pending.push_back(id);
            }
            Command::Cancel { target } => {
                let target = *target;
                let mut canceled = Vec::new();
                self.pending.retain(|queued| {
                    let matches = ctx.is_same_or_descendant(*queued, target);
                    if matches {
                        canceled.push(*queued);
                    }
                    !matches
                });
                for queued in canceled {
                    ctx.cancel(queued);
                }
                ctx.complete(id);
            }
            Command::Flush { path } => {
                let path = path.clone();
                self.flush_cache(&path);
                ctx.complete(id);
            }
            Command::FlushAll => {
                self.flush_entire_cache();
                ctx.complete(id);
            }
            other => {
                let failure = RequestFailure::unsupported(other.kind_name());
                self.fail(ctx, id, failure);
            }
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let Some(id) = self.pending.pop_front() else {
            return false;
        };
        let Some(request) = ctx.request(id) else {
            debug!(%id, "dropping stale request from drive queue");
            return true;
        };
        if request.status().is_terminal() {
            return true;
        }

        match request.command() {
            Command::Read {
                path, offset, size, ..
            } => {
                let (path, offset, size) = (path.clone(), *offset, *size);
                self.read_file(ctx, id, &path, offset, size);
            }
            Command::FileExists { path, .. } => {
                let path = path.clone();
                self.file_exists(ctx, id, &path);
            }
            Command::FileMetadata { path, .. } => {
                let path = path.clone();
                self.file_metadata(ctx, id, &path);
            }
            Command::Custom { .. } => {
                ctx.complete(id);
            }
            other => {
                let failure = RequestFailure::unsupported(other.kind_name());
                self.fail(ctx, id, failure);
            }
        }
        true
    }

    fn available_request_slots(&self) -> usize {
        self.max_concurrent_requests
            .saturating_sub(self.pending.len())
    }

    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &[RequestId],
        external_pending: &[RequestId],
    ) {
        let mut cursor = now;
        for id in self
            .pending
            .iter()
            .chain(internal_pending)
            .chain(external_pending)
        {
            let Some(request) = ctx.request(*id) else {
                continue;
            };
            cursor += self.estimate_cost(request.command());
            ctx.set_estimated_completion(*id, cursor);
        }
    }

    fn file_size(&self, path: &RequestPath) -> Option<u64> {
        self.lookup_size(path).ok()
    }

    fn flush_cache(&mut self, path: &RequestPath) {
        if let Some(slot) = self.find_file_in_cache(path) {
            let entry = self.remove_slot(slot);
            self.close_handle(entry);
        }
    }

    fn flush_entire_cache(&mut self) {
        self.active_slot = None;
        for entry in std::mem::take(&mut self.cache) {
            self.close_handle(entry);
        }
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        let owner = self.name().to_owned();
        let counters = &self.counters;
        let count = |name: &'static str, value: u64| Statistic::count(owner.clone(), name, value);
        out.push(count("pending", self.pending.len() as u64));
        out.push(count("open_handles", self.cache.len() as u64));
        out.push(count("max_file_handles", self.max_file_handles as u64));
        out.push(count("opens", counters.opens));
        out.push(count("evictions", counters.evictions));
        out.push(count("reads", counters.reads));
        out.push(count("failed_requests", counters.failed_requests));
        out.push(count("sequential_reads", counters.sequential_reads));
        out.push(count("bytes_read", counters.bytes_read));
        let average = |name: &'static str, window: &AverageWindow<TIMING_WINDOW>| {
            Statistic::float(owner.clone(), name, window.average())
        };
        out.push(average("average_open_time_us", &self.open_time_us));
        out.push(average("average_close_time_us", &self.close_time_us));
        out.push(average("average_read_time_us", &self.read_time_us));
        out.push(average("average_read_size", &self.read_size));
    }
}
