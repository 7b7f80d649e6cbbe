//! # 调度器与驱动循环
//!
//! ## 角色定位（Why）
//! - 独占 [`StreamerContext`] 与整条栈，是唯一推进请求生命周期的执行者；
//! - 把“接收提交 → 准备 → 派发 → 执行 → 终结 → 刷新预估”固化为一个节拍，测试可以逐拍驱动，
//!   线程版本只是在节拍之间按条件变量休眠。
//!
//! ## 派发规则（What）
//! - 控制类命令先于数据命令处理，且不受空位限制：同一节拍内先到的取消总能拦住尚未派发的读取；
//! - 数据命令按“优先级降序 → 截止时间升序（无截止时间排最后）→ 路径 → 偏移”排序，
//!   只在栈报告空位时逐个派发，其余留在已准备队列；
//! - 挂起期间不派发任何数据命令，控制命令照常执行，栈内在途工作继续完成。
//!
//! ## 休眠与唤醒（How）
//! - `run` 在每轮把可做的工作做完后才在条件变量上等待，等待上限为 `idle_tick`；
//! - 唤醒标志在被消费前一直有效，等待开始前到达的唤醒不会丢失。

use std::{
    cmp::Reverse,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info};

use crate::{
    config::StreamerConfig,
    context::{ContextHandle, StreamerContext},
    error::Result,
    fs::FileSystem,
    path::RequestPath,
    request::{Command, Priority, RequestId, RequestUsage},
    stack::{StreamStackEntry, build_stack, layer_names},
    statistics::Statistic,
};

const OWNER: &str = "scheduler";

#[derive(Default)]
struct SchedulerStatistics {
    ticks: u64,
    dispatched: u64,
    control: u64,
    rescheduled: u64,
}

pub struct Scheduler {
    ctx: StreamerContext,
    stack: Box<dyn StreamStackEntry>,
    handle: ContextHandle,
    stats: SchedulerStatistics,
}

type DispatchKey = (Reverse<Priority>, bool, Option<Instant>, Option<RequestPath>, u64);

impl Scheduler {
    pub fn new(ctx: StreamerContext, stack: Box<dyn StreamStackEntry>) -> Self {
        let handle = ctx.handle();
        Self {
            ctx,
            stack,
            handle,
            stats: SchedulerStatistics::default(),
        }
    }

    /// 校验配置并组装上下文与栈。
    pub fn from_config(config: &StreamerConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        config.validate()?;
        let ctx = StreamerContext::new(config.max_external_requests);
        Ok(Self::new(ctx, build_stack(config, fs)))
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &StreamerContext {
        &self.ctx
    }

    pub fn stack(&self) -> &dyn StreamStackEntry {
        self.stack.as_ref()
    }

    /// 执行一个节拍，返回是否取得进展。
    pub fn run_once(&mut self) -> bool {
        self.stats.ticks += 1;
        let ingested = self.ingest_submissions();
        let dispatched = self.dispatch_prepared();
        let executed = self.stack.execute_requests(&mut self.ctx);
        let finalized = self.ctx.finalize_completed_requests();
        self.refresh_estimates();
        ingested || dispatched || executed || finalized
    }

    /// 重复节拍直到没有任何进展。
    pub fn process_till_idle(&mut self) {
        while self.run_once() {}
    }

    fn ingest_submissions(&mut self) -> bool {
        let accepted = self.ctx.accept_submissions();
        for id in &accepted {
            self.stack.prepare_request(&mut self.ctx, *id);
        }
        !accepted.is_empty()
    }

    fn dispatch_prepared(&mut self) -> bool {
        let prepared = self.ctx.take_prepared_requests();
        if prepared.is_empty() {
            return false;
        }

        let ctx = &self.ctx;
        let (control, mut data): (Vec<RequestId>, Vec<RequestId>) = prepared
            .into_iter()
            .filter(|id| {
                ctx.request(*id)
                    .is_some_and(|request| !request.status().is_terminal())
            })
            .partition(|id| {
                ctx.request(*id)
                    .is_some_and(|request| request.command().is_control())
            });

        let mut progressed = !control.is_empty();
        for id in control {
            self.stats.control += 1;
            self.dispatch_control(id, &mut data);
        }

        if self.handle.is_suspended() {
            self.ctx.restore_prepared_requests(data);
            return progressed;
        }

        let ctx = &self.ctx;
        data.sort_by_cached_key(|id| dispatch_key(ctx, *id));
        let mut pending = data.into_iter();
        while self.stack.available_request_slots() > 0 {
            let Some(id) = pending.next() else {
                break;
            };
            self.stack.queue_request(&mut self.ctx, id);
            self.stats.dispatched += 1;
            progressed = true;
        }
        self.ctx.restore_prepared_requests(pending.collect());
        progressed
    }

    fn dispatch_control(&mut self, id: RequestId, data: &mut Vec<RequestId>) {
        let Some(request) = self.ctx.request(id) else {
            return;
        };
        match request.command() {
            Command::Cancel { target } => {
                let target = *target;
                let ctx = &self.ctx;
                let mut canceled = Vec::new();
                data.retain(|queued| {
                    let matches = ctx.is_same_or_descendant(*queued, target);
                    if matches {
                        canceled.push(*queued);
                    }
                    !matches
                });
                for queued in canceled {
                    self.ctx.cancel(queued);
                }
                self.stack.queue_request(&mut self.ctx, id);
            }
            Command::Reschedule {
                target,
                deadline,
                priority,
            } => {
                let (target, deadline, priority) = (*target, *deadline, *priority);
                if let Some(request) = self.ctx.request_mut(target) {
                    request.set_schedule(deadline, priority);
                }
                for queued in data.iter() {
                    if self.ctx.has_ancestor(*queued, target)
                        && let Some(request) = self.ctx.request_mut(*queued)
                    {
                        request.set_schedule(deadline, priority);
                    }
                }
                self.stats.rescheduled += 1;
                debug!(%target, priority = priority.0, "rescheduled request");
                self.ctx.complete(id);
            }
            Command::Report { .. } => {
                let mut statistics = Vec::new();
                self.collect_statistics(&mut statistics);
                if let Some(Command::Report { statistics: slot }) = self
                    .ctx
                    .request_mut(id)
                    .map(|request| request.command_mut())
                {
                    *slot = statistics;
                }
                self.ctx.complete(id);
            }
            Command::None => {
                self.ctx.complete(id);
            }
            _ => self.stack.queue_request(&mut self.ctx, id),
        }
    }

    fn refresh_estimates(&mut self) {
        self.ctx.clear_estimates();
        let (internal, external): (Vec<RequestId>, Vec<RequestId>) = self
            .ctx
            .prepared_requests()
            .iter()
            .partition(|id| id.usage() == RequestUsage::Internal);
        self.stack
            .update_completion_estimates(&mut self.ctx, Instant::now(), &internal, &external);
    }

    /// 调度器、上下文与各栈层的统计。
    pub fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        out.push(Statistic::count(OWNER, "ticks", self.stats.ticks));
        out.push(Statistic::count(OWNER, "dispatched", self.stats.dispatched));
        out.push(Statistic::count(OWNER, "control", self.stats.control));
        out.push(Statistic::count(OWNER, "rescheduled", self.stats.rescheduled));
        out.push(Statistic::count(
            OWNER,
            "suspended",
            u64::from(self.handle.is_suspended()),
        ));
        self.ctx.collect_statistics(out);
        self.stack.collect_statistics(out);
    }

    /// 驱动线程主循环：做完所有就绪工作后在条件变量上休眠，直到被唤醒或 `idle_tick` 到期。
    pub fn run(mut self, idle_tick: Duration) {
        info!(layers = ?layer_names(self.stack.as_ref()), "streamer driver thread started");
        while !self.handle.is_shutting_down() {
            self.process_till_idle();
            if self.handle.is_shutting_down() {
                break;
            }
            if !self.ctx.has_submissions() {
                self.ctx.wait_for_wake(idle_tick);
            }
        }
        self.shutdown();
    }

    /// 关闭提交入口，完成已接收的工作，取消剩余请求并关闭所有句柄。
    ///
    /// 排空阶段忽略挂起状态，保证每个已接收的请求都得到一次回调。
    pub fn shutdown(&mut self) {
        for id in self.ctx.close_submissions() {
            self.stack.prepare_request(&mut self.ctx, id);
        }
        self.handle.resume_processing();
        self.process_till_idle();

        let mut canceled = 0_usize;
        loop {
            let leaves: Vec<RequestId> = self
                .ctx
                .live_request_ids()
                .into_iter()
                .filter(|id| {
                    self.ctx.request(*id).is_some_and(|request| {
                        !request.status().is_terminal() && request.pending_children() == 0
                    })
                })
                .collect();
            if leaves.is_empty() {
                break;
            }
            for id in leaves {
                if self.ctx.cancel(id) {
                    canceled += 1;
                }
            }
            self.ctx.finalize_completed_requests();
        }
        self.ctx.finalize_completed_requests();
        self.stack.flush_entire_cache();
        info!(
            canceled,
            live = self.ctx.live_request_count(),
            "streamer driver thread stopped"
        );
    }
}

fn dispatch_key(ctx: &StreamerContext, id: RequestId) -> DispatchKey {
    match ctx.request(id) {
        Some(request) => {
            let deadline = request.deadline();
            (
                Reverse(request.priority()),
                deadline.is_none(),
                deadline,
                request.command().path().cloned(),
                request.command().offset(),
            )
        }
        None => (Reverse(Priority::LOWEST), true, None, None, 0),
    }
}
