//! 测试桩：内存文件系统。
//!
//! # 设计定位（Why）
//! - 存储驱动的缓存、淘汰与短读策略需要可观测的文件系统：打开次数、物理读取次数、存活句柄数；
//! - 单元测试、集成测试与基准共用同一实现，接口变更时集中获得编译错误提示。
//!
//! # 使用方式（How）
//! - [`MemoryFileSystem`] 可克隆，克隆体共享同一份状态；一份交给 Streamer（`Arc<dyn FileSystem>`），
//!   另一份留在测试中读取计数器；
//! - [`MemoryFileSystem::fail_reads`] 为指定路径注入 I/O 错误；
//! - [`MemoryFileSystem::truncate_reads`] 让设备返回少于请求的字节数，模拟介质截断。
//!
//! # 契约说明（What）
//! - 打开时对文件内容做快照，之后的 `insert`/`remove` 不影响已打开的句柄；
//! - 句柄 Drop 即视为关闭，`live_handle_count` 随之递减。

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    fs::{FileHandle, FileSystem},
    path::RequestPath,
};

#[derive(Default)]
struct Inner {
    files: Mutex<HashMap<RequestPath, Bytes>>,
    read_failures: Mutex<HashMap<RequestPath, io::ErrorKind>>,
    truncated: Mutex<HashMap<RequestPath, usize>>,
    opens: AtomicUsize,
    reads: AtomicUsize,
    live_handles: AtomicUsize,
}

/// 计数型内存文件系统。
#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    inner: Arc<Inner>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构造时写入一个文件。
    pub fn with_file(self, path: impl Into<RequestPath>, data: impl Into<Bytes>) -> Self {
        self.insert(path, data);
        self
    }

    pub fn insert(&self, path: impl Into<RequestPath>, data: impl Into<Bytes>) {
        self.inner.files.lock().insert(path.into(), data.into());
    }

    pub fn remove(&self, path: impl Into<RequestPath>) {
        self.inner.files.lock().remove(&path.into());
    }

    /// 之后对 `path` 的所有读取都以 `kind` 失败。
    pub fn fail_reads(&self, path: impl Into<RequestPath>, kind: io::ErrorKind) {
        self.inner.read_failures.lock().insert(path.into(), kind);
    }

    /// 之后对 `path` 的每次读取最多返回 `max_bytes` 字节。
    pub fn truncate_reads(&self, path: impl Into<RequestPath>, max_bytes: usize) {
        self.inner.truncated.lock().insert(path.into(), max_bytes);
    }

    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn live_handle_count(&self) -> usize {
        self.inner.live_handles.load(Ordering::SeqCst)
    }

    /// 以 trait 对象形式共享给 Streamer。
    pub fn shared(&self) -> Arc<dyn FileSystem> {
        Arc::new(self.clone())
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &RequestPath) -> io::Result<Box<dyn FileHandle>> {
        let data = self
            .inner
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryHandle {
            inner: Arc::clone(&self.inner),
            path: path.clone(),
            data,
        }))
    }

    fn file_size(&self, path: &RequestPath) -> io::Result<u64> {
        self.inner
            .files
            .lock()
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

struct MemoryHandle {
    inner: Arc<Inner>,
    path: RequestPath,
    data: Bytes,
}

impl FileHandle for MemoryHandle {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.inner.read_failures.lock().get(&self.path) {
            return Err(io::Error::from(*kind));
        }

        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let mut available = self.data.len() - start;
        if let Some(limit) = self.inner.truncated.lock().get(&self.path) {
            available = available.min(*limit);
        }
        let copied = available.min(buf.len());
        buf[..copied].copy_from_slice(&self.data[start..start + copied]);
        Ok(copied)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.inner.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}
