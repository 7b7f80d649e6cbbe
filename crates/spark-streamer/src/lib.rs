#![deny(unsafe_code)]
#![doc = "spark-streamer: 单线程驱动的异步文件流式读取引擎。"]
#![doc = ""]
#![doc = "调用方在任意线程申请并提交 [`FileRequest`]，驱动线程把请求送入由配置组装的"]
#![doc = "[`StreamStackEntry`] 栈（读取拆分 → 存储驱动），完成后在驱动线程上恰好回调一次。"]
#![doc = ""]
#![doc = "== 模块地图 =="]
#![doc = "- [`path`]：归一化路径与稳定哈希；"]
#![doc = "- [`request`]：请求、命令、状态机与完成结果；"]
#![doc = "- [`context`]：请求 arena、跨线程提交与完成队列；"]
#![doc = "- [`stack`]：栈层协议与内置层；"]
#![doc = "- [`scheduler`] / [`streamer`]：驱动循环与对外门面；"]
#![doc = "- [`config`]、[`error`]、[`statistics`]、[`observability`]：配置、错误、统计与日志安装。"]

pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod observability;
pub mod path;
pub mod request;
pub mod scheduler;
pub mod stack;
pub mod statistics;
pub mod streamer;
mod sync;
pub mod test_stubs;

pub use config::{LayerConfig, StreamerConfig};
pub use context::{ContextHandle, StreamerContext};
pub use error::{FailureKind, RequestFailure, Result, StreamerError};
pub use fs::{FileHandle, FileSystem, OsFileSystem};
pub use path::RequestPath;
pub use request::{
    BatchEntry, Command, CompletedRequest, CompletionCallback, FileRequest, Priority, RequestId,
    RequestOutput, RequestStatus, RequestUsage,
};
pub use scheduler::Scheduler;
pub use stack::{ReadSplitter, StackEntryBase, StorageDrive, StreamStackEntry, build_stack};
pub use statistics::{Statistic, StatisticValue};
pub use streamer::Streamer;
