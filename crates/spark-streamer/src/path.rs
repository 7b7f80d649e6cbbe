//! 请求路径键。
//!
//! # 契约说明（What）
//! - [`RequestPath`] 在构造时完成一次规范化，之后不可变；
//! - 两个路径相等当且仅当规范化后的字节序列完全一致；
//! - 哈希值在构造时预先计算（FNV-1a 64），进程生命周期内稳定，可直接作为句柄缓存与查找键。
//!
//! # 规范化规则（How）
//! - `\` 统一替换为 `/`；
//! - 连续分隔符折叠为一个，去除末尾分隔符（根路径 `/` 除外）；
//! - `.` 段被移除，`..` 段回退上一个普通段；位于相对路径开头的 `..` 原样保留，绝对路径根部的 `..` 被丢弃。
//! - 大小写保持原样，不做平台相关的折叠。

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    path::Path,
    sync::Arc,
};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 规范化后的文件路径键。
///
/// 内部以 `Arc<str>` 存储，克隆只增加引用计数；请求拆分时子请求与父请求共享同一份路径。
#[derive(Clone)]
pub struct RequestPath {
    normalized: Arc<str>,
    hash: u64,
}

impl RequestPath {
    /// 由原始字符串构造并规范化。
    pub fn new(raw: &str) -> Self {
        let normalized = normalize(raw);
        let hash = fnv1a(normalized.as_bytes());
        Self {
            normalized: Arc::from(normalized),
            hash,
        }
    }

    /// 规范化后的字符串形式。
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// 以 [`Path`] 视图访问，供文件系统适配层使用。
    pub fn as_path(&self) -> &Path {
        Path::new(&*self.normalized)
    }

    /// 构造时预计算的稳定哈希。
    pub const fn stable_hash(&self) -> u64 {
        self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    pub fn is_absolute(&self) -> bool {
        self.normalized.starts_with('/')
    }
}

fn normalize(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                // 绝对路径不能越过根目录。
                _ if absolute => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        let mut rooted = String::with_capacity(joined.len() + 1);
        rooted.push('/');
        rooted.push_str(&joined);
        rooted
    } else {
        joined
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

impl PartialEq for RequestPath {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.normalized == other.normalized
    }
}

impl Eq for RequestPath {}

impl Hash for RequestPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for RequestPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl AsRef<Path> for RequestPath {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

impl fmt::Debug for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestPath").field(&self.normalized).finish()
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl From<&str> for RequestPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RequestPath {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<&String> for RequestPath {
    fn from(value: &String) -> Self {
        Self::new(value)
    }
}

impl From<&Path> for RequestPath {
    fn from(value: &Path) -> Self {
        Self::new(&value.to_string_lossy())
    }
}

impl From<&RequestPath> for RequestPath {
    fn from(value: &RequestPath) -> Self {
        value.clone()
    }
}
