//! 读取拆分层：把超过 `max_read_size` 的读取切成首尾相接的子读取，按下游空位逐个转发。
//!
//! 持有尚未转发的子读取时对上游报告零空位，避免新请求插入到拆分序列之间。

use std::{collections::VecDeque, time::Instant};

use super::{StackEntryBase, StreamStackEntry, spawn_children};
use crate::{
    context::StreamerContext,
    request::{Command, ReadOutput, RequestId},
    statistics::Statistic,
};

pub struct ReadSplitter {
    base: StackEntryBase,
    max_read_size: u64,
    held: VecDeque<RequestId>,
    split_requests: u64,
    splits_created: u64,
}

impl ReadSplitter {
    /// `max_read_size` 为零时按 1 字节处理。
    pub fn new(max_read_size: u64) -> Self {
        Self {
            base: StackEntryBase::new("read_splitter"),
            max_read_size: max_read_size.max(1),
            held: VecDeque::new(),
            split_requests: 0,
            splits_created: 0,
        }
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// 按下游空位转发持有的子读取，返回转发数量。
    fn forward_held(&mut self, ctx: &mut StreamerContext) -> usize {
        let Some(next) = self.base.next.as_deref_mut() else {
            return 0;
        };
        let mut forwarded = 0;
        while next.available_request_slots() > 0 {
            let Some(child) = self.held.pop_front() else {
                break;
            };
            if ctx
                .request(child)
                .is_none_or(|request| request.status().is_terminal())
            {
                continue;
            }
            next.queue_request(ctx, child);
            forwarded += 1;
        }
        forwarded
    }
}

fn split_ranges(offset: u64, size: u64, max: u64) -> impl Iterator<Item = (u64, u64)> {
    let end = offset.saturating_add(size);
    let mut start = offset;
    std::iter::from_fn(move || {
        if start >= end {
            return None;
        }
        let len = max.min(end - start);
        let range = (start, len);
        start += len;
        Some(range)
    })
}

impl StreamStackEntry for ReadSplitter {
    fn base(&self) -> &StackEntryBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackEntryBase {
        &mut self.base
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let Some(request) = ctx.request(id) else {
            return;
        };
        match request.command() {
            Command::Read {
                path, offset, size, ..
            } if *size > self.max_read_size => {
                let path = path.clone();
                let children: Vec<Command> = split_ranges(*offset, *size, self.max_read_size)
                    .map(|(start, len)| Command::Read {
                        path: path.clone(),
                        offset: start,
                        size: len,
                        output: ReadOutput::default(),
                        batch_slot: None,
                    })
                    .collect();
                self.split_requests += 1;
                let held = &mut self.held;
                let spawned = spawn_children(ctx, id, children, |_, child| held.push_back(child));
                self.splits_created += spawned as u64;
                self.forward_held(ctx);
            }
            Command::Cancel { target } => {
                let target = *target;
                let mut canceled = Vec::new();
                self.held.retain(|child| {
                    let matches = ctx.is_same_or_descendant(*child, target);
                    if matches {
                        canceled.push(*child);
                    }
                    !matches
                });
                for child in canceled {
                    ctx.cancel(child);
                }
                match self.next_mut() {
                    Some(next) => next.queue_request(ctx, id),
                    None => {
                        ctx.complete(id);
                    }
                }
            }
            _ => match self.next_mut() {
                Some(next) => next.queue_request(ctx, id),
                None => super::reject_unsupported(ctx, id),
            },
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let forwarded = self.forward_held(ctx) > 0;
        let executed = self
            .next_mut()
            .is_some_and(|next| next.execute_requests(ctx));
        forwarded || executed
    }

    fn available_request_slots(&self) -> usize {
        if !self.held.is_empty() {
            return 0;
        }
        self.next()
            .map_or(0, |next| next.available_request_slots())
    }

    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &[RequestId],
        external_pending: &[RequestId],
    ) {
        let mut internal: Vec<RequestId> = self.held.iter().copied().collect();
        internal.extend_from_slice(internal_pending);
        if let Some(next) = self.next_mut() {
            next.update_completion_estimates(ctx, now, &internal, external_pending);
        }
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        let owner = self.name().to_owned();
        out.push(Statistic::count(owner.clone(), "held", self.held.len() as u64));
        out.push(Statistic::count(owner.clone(), "split_requests", self.split_requests));
        out.push(Statistic::count(owner, "splits_created", self.splits_created));
        if let Some(next) = self.next() {
            next.collect_statistics(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        request::{RequestOutput, RequestStatus},
        stack::StorageDrive,
        test_stubs::MemoryFileSystem,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn stack(fs: &MemoryFileSystem, max_read_size: u64) -> ReadSplitter {
        let mut splitter = ReadSplitter::new(max_read_size);
        splitter.set_next(Box::new(StorageDrive::new(fs.shared(), 4, 1)));
        splitter
    }

    #[test]
    fn ranges_cover_the_window_contiguously() {
        let ranges: Vec<_> = split_ranges(10, 10, 4).collect();
        assert_eq!(ranges, vec![(10, 4), (14, 4), (18, 2)]);
        assert_eq!(split_ranges(0, 0, 4).count(), 0);
    }

    #[test]
    fn large_read_is_split_and_reassembled() {
        let data: Vec<u8> = (0..=255).collect();
        let fs = MemoryFileSystem::new().with_file("big.bin", data.clone());
        let mut splitter = stack(&fs, 100);
        let mut ctx = StreamerContext::new(None);

        let id = ctx.get_new_internal_request().expect("allocate");
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        ctx.request_mut(id)
            .expect("live")
            .create_read("big.bin", 0, 256)
            .set_completion_callback(move |done| *sink.lock() = Some(done));

        splitter.prepare_request(&mut ctx, id);
        for prepared in ctx.take_prepared_requests() {
            splitter.queue_request(&mut ctx, prepared);
        }
        assert_eq!(splitter.held_len(), 2, "first split forwarded to the drive");
        assert_eq!(splitter.available_request_slots(), 0);

        while splitter.execute_requests(&mut ctx) || ctx.finalize_completed_requests() {}

        let done = result.lock().take().expect("completed");
        assert_eq!(done.status, RequestStatus::Completed);
        assert!(matches!(&done.output, RequestOutput::Read(bytes) if bytes[..] == data[..]));
        assert_eq!(fs.read_count(), 3);
        assert_eq!(ctx.live_request_count(), 0);
        assert_eq!(splitter.available_request_slots(), 1);
    }

    #[test]
    fn cancel_reaches_held_splits() {
        let fs = MemoryFileSystem::new().with_file("big.bin", vec![7_u8; 1000]);
        let mut splitter = stack(&fs, 100);
        let mut ctx = StreamerContext::new(None);

        let id = ctx.get_new_internal_request().expect("allocate");
        let result = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&result);
        ctx.request_mut(id)
            .expect("live")
            .create_read("big.bin", 0, 1000)
            .set_completion_callback(move |done| sink.lock().push(done.status));
        splitter.prepare_request(&mut ctx, id);
        for prepared in ctx.take_prepared_requests() {
            splitter.queue_request(&mut ctx, prepared);
        }

        let cancel = ctx.get_new_internal_request().expect("cancel");
        ctx.request_mut(cancel).expect("live").create_cancel(id);
        splitter.queue_request(&mut ctx, cancel);
        assert_eq!(splitter.held_len(), 0);

        while splitter.execute_requests(&mut ctx) || ctx.finalize_completed_requests() {}
        assert_eq!(*result.lock(), vec![RequestStatus::Canceled]);
        assert_eq!(fs.read_count(), 0);
        assert_eq!(ctx.live_request_count(), 0);
    }
}
