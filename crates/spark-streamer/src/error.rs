//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 区分两类失败：调用 API 本身失败（[`StreamerError`]，通过 `Result` 返回给调用方），
//!   与单个请求在栈内执行失败（[`RequestFailure`]，附着在请求上、经完成回调送达）。
//! - 层内的 I/O 失败只终止受影响的请求，不会中断驱动线程或其他在途请求。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，可直接交给 `anyhow` 等上层框架；
//! - [`FailureKind::code`] 提供稳定的点分错误码，便于告警与日志聚合。

use std::{fmt, io};

use thiserror::Error;

use crate::{
    config::ConfigError,
    path::RequestPath,
    request::{RequestId, RequestStatus},
};

/// crate 内统一的 `Result` 别名，默认错误类型为 [`StreamerError`]。
pub type Result<T, E = StreamerError> = core::result::Result<T, E>;

/// Streamer API 层面的错误域。
///
/// # 契约说明（What）
/// - `AllocatorExhausted` 对发起调用是致命的：调用方拿不到请求对象，也就不存在悬垂句柄；
/// - `StaleRequest` 表示句柄的代际号与槽位不匹配，请求已被回收或从未由本上下文分配；
/// - `RecycleRejected` 在请求仍有存活子请求、仍在完成队列中或回调尚未触发时返回；
/// - `InvalidTransition` 对应状态机拒绝的回退迁移。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StreamerError {
    #[error("request allocator exhausted: {limit} external requests are already outstanding")]
    AllocatorExhausted { limit: usize },

    #[error("request {id} is stale or was not allocated by this context")]
    StaleRequest { id: RequestId },

    #[error("request {id} cannot be recycled: {reason}")]
    RecycleRejected { id: RequestId, reason: &'static str },

    #[error("request {id} cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("streamer is shutting down and no longer accepts requests")]
    ShuttingDown,

    #[error("failed to spawn streamer driver thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// 请求失败的机器可读分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FailureKind {
    /// 执行时路径不存在。
    NotFound,
    /// `offset + size` 超出文件长度，或设备返回的字节数少于请求值。
    ShortRead,
    /// 设备或操作系统的瞬时失败。
    DeviceBusy,
    /// 句柄、内存等资源耗尽。
    ResourceExhausted,
    /// 栈内没有任何层能处理该请求类型。
    Unsupported,
}

impl FailureKind {
    /// 稳定错误码，格式为 `streamer.<域>.<原因>`。
    pub const fn code(self) -> &'static str {
        match self {
            FailureKind::NotFound => "streamer.read.not_found",
            FailureKind::ShortRead => "streamer.read.short_read",
            FailureKind::DeviceBusy => "streamer.device.busy",
            FailureKind::ResourceExhausted => "streamer.device.resource_exhausted",
            FailureKind::Unsupported => "streamer.stack.unsupported",
        }
    }

    /// 将操作系统错误映射为失败分类。
    ///
    /// `EMFILE`/`ENFILE` 与内存不足视为资源耗尽，其余未知错误统一视为设备繁忙。
    pub fn from_io(error: &io::Error) -> Self {
        const TOO_MANY_OPEN_FILES_IN_SYSTEM: i32 = 23;
        const TOO_MANY_OPEN_FILES: i32 = 24;

        match error.kind() {
            io::ErrorKind::NotFound => FailureKind::NotFound,
            io::ErrorKind::UnexpectedEof => FailureKind::ShortRead,
            io::ErrorKind::OutOfMemory => FailureKind::ResourceExhausted,
            io::ErrorKind::Unsupported => FailureKind::Unsupported,
            _ => match error.raw_os_error() {
                Some(TOO_MANY_OPEN_FILES_IN_SYSTEM | TOO_MANY_OPEN_FILES) => {
                    FailureKind::ResourceExhausted
                }
                _ => FailureKind::DeviceBusy,
            },
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 附着在失败请求上的错误详情：分类 + 人类可读描述。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct RequestFailure {
    kind: FailureKind,
    detail: String,
}

impl RequestFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(path: &RequestPath) -> Self {
        Self::new(FailureKind::NotFound, format!("file `{path}` does not exist"))
    }

    /// 读取窗口越过文件尾或设备返回不足。
    pub fn short_read(path: &RequestPath, offset: u64, requested: u64, available: u64) -> Self {
        Self::new(
            FailureKind::ShortRead,
            format!(
                "requested {requested} bytes at offset {offset} from `{path}` but only {available} bytes are available"
            ),
        )
    }

    /// 将 `io::Error` 转换为失败详情，保留原始错误描述。
    pub fn from_io(path: &RequestPath, error: &io::Error) -> Self {
        let kind = FailureKind::from_io(error);
        match kind {
            FailureKind::NotFound => Self::not_found(path),
            _ => Self::new(kind, format!("i/o failure on `{path}`: {error}")),
        }
    }

    pub fn unsupported(command: &str) -> Self {
        Self::new(
            FailureKind::Unsupported,
            format!("`{command}` requests are not handled by any stream stack layer"),
        )
    }

    pub const fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}
