//! 场景测试共用的驱动封装：同步逐拍推进调度器，并收集每个请求的完成结果。

use std::sync::Arc;

use parking_lot::Mutex;
use spark_streamer::{
    CompletedRequest, ContextHandle, FileRequest, LayerConfig, RequestId, Scheduler,
    StreamerConfig, statistics::Statistic, test_stubs::MemoryFileSystem,
};

pub type Completions = Arc<Mutex<Vec<CompletedRequest>>>;

pub struct Harness {
    pub fs: MemoryFileSystem,
    pub scheduler: Scheduler,
    pub handle: ContextHandle,
}

impl Harness {
    pub fn new(fs: MemoryFileSystem) -> Self {
        Self::with_stack(fs, vec![LayerConfig::storage_drive()])
    }

    pub fn with_stack(fs: MemoryFileSystem, stack: Vec<LayerConfig>) -> Self {
        let config = StreamerConfig {
            stack,
            ..StreamerConfig::default()
        };
        Self::with_config(fs, &config)
    }

    pub fn with_config(fs: MemoryFileSystem, config: &StreamerConfig) -> Self {
        let scheduler = Scheduler::from_config(config, fs.shared()).expect("valid configuration");
        let handle = scheduler.handle();
        Self {
            fs,
            scheduler,
            handle,
        }
    }

    /// 申请、配置并提交一个外部请求，返回其标识与完成结果收集器。
    pub fn submit(&self, configure: impl FnOnce(&mut FileRequest)) -> (RequestId, Completions) {
        let completions: Completions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&completions);
        let mut request = self.handle.get_new_external_request().expect("allocate");
        configure(&mut request);
        request.set_completion_callback(move |done| sink.lock().push(done));
        let id = self.handle.queue_request(request).expect("queue");
        (id, completions)
    }

    pub fn run(&mut self) {
        self.scheduler.process_till_idle();
    }

    pub fn statistics(&mut self) -> Vec<Statistic> {
        let (_, done) = self.submit(|request| {
            request.create_report();
        });
        self.run();
        let mut done = done.lock();
        assert_eq!(done.len(), 1, "report completes exactly once");
        match std::mem::take(&mut done[0].output) {
            spark_streamer::RequestOutput::Statistics(values) => values,
            other => panic!("unexpected report output: {other:?}"),
        }
    }
}

/// 取出唯一的完成结果；回调次数不是一时直接失败。
pub fn single(completions: &Completions) -> CompletedRequest {
    let mut done = completions.lock();
    assert_eq!(done.len(), 1, "exactly one callback expected");
    done.remove(0)
}

pub fn stat(values: &[Statistic], owner: &str, name: &str) -> i64 {
    spark_streamer::statistics::find(values, owner, name)
        .and_then(|stat| stat.value().as_i64())
        .unwrap_or_else(|| panic!("missing statistic {owner}.{name}"))
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
