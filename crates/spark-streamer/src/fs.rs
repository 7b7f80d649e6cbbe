//! 文件系统原语。
//!
//! 存储驱动只依赖 [`FileSystem`] 与 [`FileHandle`] 两个 trait：打开、定位读取、查询长度、
//! 关闭（drop 句柄即关闭）。生产环境使用 [`OsFileSystem`]，测试使用
//! [`crate::test_stubs::MemoryFileSystem`]。

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::PathBuf,
};

use crate::path::RequestPath;

/// 已打开的文件句柄。Drop 即关闭。
pub trait FileHandle: Send {
    /// 从 `offset` 开始读取，最多填满 `buf`，返回实际读取的字节数。
    ///
    /// 返回值小于 `buf.len()` 表示到达文件末尾或设备提前截断，由调用方判定是否为短读。
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// 文件当前长度（字节）。
    fn size(&self) -> io::Result<u64>;
}

/// 可被驱动线程调用的文件系统。
pub trait FileSystem: Send + Sync + 'static {
    fn open(&self, path: &RequestPath) -> io::Result<Box<dyn FileHandle>>;

    fn file_size(&self, path: &RequestPath) -> io::Result<u64>;

    /// 路径是否存在。默认通过 `file_size` 判定，`NotFound` 视为不存在，其余错误向上传播。
    fn exists(&self, path: &RequestPath) -> io::Result<bool> {
        match self.file_size(path) {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// 基于 `std::fs` 的文件系统实现。
///
/// 相对路径按 `root` 解析；未设置 `root` 时按进程当前目录解析。
#[derive(Clone, Debug, Default)]
pub struct OsFileSystem {
    root: Option<PathBuf>,
}

impl OsFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &RequestPath) -> PathBuf {
        match &self.root {
            Some(root) if !path.is_absolute() => root.join(path.as_path()),
            _ => path.as_path().to_path_buf(),
        }
    }
}

impl FileSystem for OsFileSystem {
    fn open(&self, path: &RequestPath) -> io::Result<Box<dyn FileHandle>> {
        let file = File::open(self.resolve(path))?;
        Ok(Box::new(OsFileHandle { file, position: 0 }))
    }

    fn file_size(&self, path: &RequestPath) -> io::Result<u64> {
        Ok(std::fs::metadata(self.resolve(path))?.len())
    }
}

/// 记录游标位置的 `std::fs::File`，连续读取时省去一次 seek。
struct OsFileHandle {
    file: File,
    position: u64,
}

impl FileHandle for OsFileHandle {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.position != offset {
            self.position = self.file.seek(SeekFrom::Start(offset))?;
        }

        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    // 失败后游标位置未知，下次读取强制 seek。
                    self.position = u64::MAX;
                    return Err(error);
                }
            }
        }
        self.position = offset + filled as u64;
        Ok(filled)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
