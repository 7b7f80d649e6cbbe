//! 请求命令：每个 [`super::FileRequest`] 携带一个标记联合。

use std::{any::Any, fmt, time::Instant};

use bytes::{Bytes, BytesMut};

use crate::{path::RequestPath, statistics::Statistic};

use super::{Priority, RequestId};

/// 批量读取中的一项。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchEntry {
    pub path: RequestPath,
    pub offset: u64,
    pub size: u64,
}

impl BatchEntry {
    pub fn new(path: impl Into<RequestPath>, offset: u64, size: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            size,
        }
    }
}

/// 读取结果的暂存区：按文件偏移记录的数据块，外加可选的调用方缓冲。
#[derive(Debug, Default)]
pub struct ReadOutput {
    target: Option<BytesMut>,
    chunks: Vec<(u64, Bytes)>,
}

impl ReadOutput {
    pub(crate) fn with_target(target: Option<BytesMut>) -> Self {
        Self {
            target,
            chunks: Vec::new(),
        }
    }

    pub(crate) fn push_chunk(&mut self, offset: u64, data: Bytes) {
        self.chunks.push((offset, data));
    }

    pub(crate) fn bytes_buffered(&self) -> usize {
        self.chunks.iter().map(|(_, data)| data.len()).sum()
    }

    /// 按偏移拼接所有数据块。
    ///
    /// 只有一个数据块且调用方未提供缓冲时直接返回该块，不做拷贝。
    pub(crate) fn assemble(&mut self) -> Bytes {
        let mut chunks = std::mem::take(&mut self.chunks);
        let target = self.target.take();
        if chunks.len() == 1 && target.is_none() {
            return chunks.pop().map(|(_, data)| data).unwrap_or_default();
        }

        chunks.sort_by_key(|(offset, _)| *offset);
        let total = chunks.iter().map(|(_, data)| data.len()).sum();
        let mut buffer = match target {
            Some(mut buffer) => {
                buffer.clear();
                buffer.reserve(total);
                buffer
            }
            None => BytesMut::with_capacity(total),
        };
        for (_, data) in &chunks {
            buffer.extend_from_slice(data);
        }
        buffer.freeze()
    }

    pub(crate) fn clear(&mut self) {
        self.target = None;
        self.chunks.clear();
    }
}

/// 请求命令。
///
/// - `ReadRequest` 是调用方发起的读取，准备阶段被转换为一个内部 `Read` 子请求；
/// - `Read` 是真正由存储驱动执行的读取，也可能被拆分层继续拆分；
/// - 控制类命令（取消、重排、刷新、报告、自定义）不受栈容量背压约束。
#[derive(Default)]
pub enum Command {
    #[default]
    None,
    ReadRequest {
        path: RequestPath,
        offset: u64,
        size: u64,
        output: ReadOutput,
    },
    Read {
        path: RequestPath,
        offset: u64,
        size: u64,
        output: ReadOutput,
        /// 属于批量读取时，结果写回父请求的位置。
        batch_slot: Option<usize>,
    },
    ReadBatch {
        entries: Vec<BatchEntry>,
        results: Vec<Option<Bytes>>,
    },
    FileExists {
        path: RequestPath,
        found: Option<bool>,
    },
    FileMetadata {
        path: RequestPath,
        size: Option<u64>,
    },
    Cancel {
        target: RequestId,
    },
    Reschedule {
        target: RequestId,
        deadline: Option<Instant>,
        priority: Priority,
    },
    Flush {
        path: RequestPath,
    },
    FlushAll,
    Report {
        statistics: Vec<Statistic>,
    },
    /// 不透明的调用方载荷。存储驱动按 FIFO 顺序完成它，可作为栅栏使用。
    Custom {
        payload: Option<Box<dyn Any + Send>>,
    },
}

impl Command {
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Command::None => "none",
            Command::ReadRequest { .. } => "read_request",
            Command::Read { .. } => "read",
            Command::ReadBatch { .. } => "read_batch",
            Command::FileExists { .. } => "file_exists",
            Command::FileMetadata { .. } => "file_metadata",
            Command::Cancel { .. } => "cancel",
            Command::Reschedule { .. } => "reschedule",
            Command::Flush { .. } => "flush",
            Command::FlushAll => "flush_all",
            Command::Report { .. } => "report",
            Command::Custom { .. } => "custom",
        }
    }

    /// 控制类命令跳过容量背压与排序。
    pub const fn is_control(&self) -> bool {
        matches!(
            self,
            Command::None
                | Command::Cancel { .. }
                | Command::Reschedule { .. }
                | Command::Flush { .. }
                | Command::FlushAll
                | Command::Report { .. }
                | Command::Custom { .. }
        )
    }

    /// 命令涉及的文件路径。
    pub fn path(&self) -> Option<&RequestPath> {
        match self {
            Command::ReadRequest { path, .. }
            | Command::Read { path, .. }
            | Command::FileExists { path, .. }
            | Command::FileMetadata { path, .. }
            | Command::Flush { path } => Some(path),
            Command::ReadBatch { entries, .. } => entries.first().map(|entry| &entry.path),
            _ => None,
        }
    }

    /// 读取类命令的起始偏移，用于同一文件内的顺序排列。
    pub fn offset(&self) -> u64 {
        match self {
            Command::ReadRequest { offset, .. } | Command::Read { offset, .. } => *offset,
            Command::ReadBatch { entries, .. } => {
                entries.first().map(|entry| entry.offset).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ReadRequest {
                path, offset, size, ..
            } => f
                .debug_struct("ReadRequest")
                .field("path", path)
                .field("offset", offset)
                .field("size", size)
                .finish_non_exhaustive(),
            Command::Read {
                path,
                offset,
                size,
                batch_slot,
                ..
            } => f
                .debug_struct("Read")
                .field("path", path)
                .field("offset", offset)
                .field("size", size)
                .field("batch_slot", batch_slot)
                .finish_non_exhaustive(),
            Command::ReadBatch { entries, .. } => f
                .debug_struct("ReadBatch")
                .field("entries", &entries.len())
                .finish_non_exhaustive(),
            Command::FileExists { path, .. } => {
                f.debug_struct("FileExists").field("path", path).finish()
            }
            Command::FileMetadata { path, .. } => {
                f.debug_struct("FileMetadata").field("path", path).finish()
            }
            Command::Cancel { target } => f.debug_struct("Cancel").field("target", target).finish(),
            Command::Reschedule {
                target,
                deadline,
                priority,
            } => f
                .debug_struct("Reschedule")
                .field("target", target)
                .field("deadline", deadline)
                .field("priority", priority)
                .finish(),
            Command::Flush { path } => f.debug_struct("Flush").field("path", path).finish(),
            other => f.write_str(other.kind_name()),
        }
    }
}
