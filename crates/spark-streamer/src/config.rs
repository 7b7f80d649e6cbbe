//! Streamer 配置。
//!
//! # 契约说明（What）
//! - 配置是普通的设置结构体，构造时按原样应用；缺失字段取下方文档化的默认值；
//! - `stack` 自上而下描述栈的组成，最后一层必须是 `storage_drive`，且只能出现在末尾；
//! - 可从 TOML 读取，字段名与 [`StreamerConfig`] 一致：
//!
//! ```toml
//! thread_name = "asset-io"
//! idle_tick_ms = 50
//!
//! [[stack]]
//! layer = "read_splitter"
//! max_read_size = 65536
//!
//! [[stack]]
//! layer = "storage_drive"
//! max_file_handles = 8
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 驱动线程默认名称。
pub const DEFAULT_THREAD_NAME: &str = "spark-streamer";
/// 无事可做时驱动线程的最长休眠时间，到期后刷新完成时间预估。
pub const DEFAULT_IDLE_TICK_MS: u64 = 100;
/// 存储驱动默认缓存的文件句柄数。
pub const DEFAULT_MAX_FILE_HANDLES: usize = 32;
/// 存储驱动默认并发度：单一物理队列。
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1;
/// 读拆分层默认的单次读取上限（1 MiB）。
pub const DEFAULT_MAX_READ_SIZE: u64 = 1024 * 1024;

/// 配置解析或校验失败。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to parse streamer configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid streamer configuration `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Streamer 顶层配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamerConfig {
    /// 驱动线程名称。
    pub thread_name: String,
    /// 驱动线程空闲等待的上限（毫秒）。
    pub idle_tick_ms: u64,
    /// 外部请求同时存活的上限；`None` 表示不设上限。
    pub max_external_requests: Option<usize>,
    /// 自上而下的栈层描述。
    pub stack: Vec<LayerConfig>,
}

/// 单个栈层的配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum LayerConfig {
    ReadSplitter {
        #[serde(default = "default_max_read_size")]
        max_read_size: u64,
    },
    StorageDrive {
        #[serde(default = "default_max_file_handles")]
        max_file_handles: usize,
        #[serde(default = "default_max_concurrent_requests")]
        max_concurrent_requests: usize,
    },
}

fn default_max_read_size() -> u64 {
    DEFAULT_MAX_READ_SIZE
}

fn default_max_file_handles() -> usize {
    DEFAULT_MAX_FILE_HANDLES
}

fn default_max_concurrent_requests() -> usize {
    DEFAULT_MAX_CONCURRENT_REQUESTS
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            idle_tick_ms: DEFAULT_IDLE_TICK_MS,
            max_external_requests: None,
            stack: vec![LayerConfig::storage_drive()],
        }
    }
}

impl LayerConfig {
    /// 使用默认参数的存储驱动层。
    pub const fn storage_drive() -> Self {
        LayerConfig::StorageDrive {
            max_file_handles: DEFAULT_MAX_FILE_HANDLES,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }

    /// 使用默认参数的读拆分层。
    pub const fn read_splitter() -> Self {
        LayerConfig::ReadSplitter {
            max_read_size: DEFAULT_MAX_READ_SIZE,
        }
    }

    const fn is_storage_drive(&self) -> bool {
        matches!(self, LayerConfig::StorageDrive { .. })
    }
}

impl StreamerConfig {
    /// 解析 TOML 文本并完成校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StreamerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    /// 校验配置取值。
    ///
    /// - `idle_tick_ms`、`max_file_handles`、`max_concurrent_requests`、`max_read_size` 必须非零；
    /// - `max_external_requests` 若设置则必须非零；
    /// - 栈非空、以存储驱动结尾，且存储驱动只出现在末尾。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "thread_name",
                reason: "must not be empty",
            });
        }
        if self.idle_tick_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "idle_tick_ms",
                reason: "must be greater than zero",
            });
        }
        if self.max_external_requests == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_external_requests",
                reason: "must be greater than zero when set",
            });
        }

        let Some((bottom, upper)) = self.stack.split_last() else {
            return Err(ConfigError::Invalid {
                field: "stack",
                reason: "must contain at least one layer",
            });
        };
        if !bottom.is_storage_drive() {
            return Err(ConfigError::Invalid {
                field: "stack",
                reason: "the bottom layer must be a storage_drive",
            });
        }
        if upper.iter().any(LayerConfig::is_storage_drive) {
            return Err(ConfigError::Invalid {
                field: "stack",
                reason: "storage_drive may only appear as the bottom layer",
            });
        }

        for layer in &self.stack {
            match *layer {
                LayerConfig::ReadSplitter { max_read_size } if max_read_size == 0 => {
                    return Err(ConfigError::Invalid {
                        field: "stack.max_read_size",
                        reason: "must be greater than zero",
                    });
                }
                LayerConfig::StorageDrive {
                    max_file_handles, ..
                } if max_file_handles == 0 => {
                    return Err(ConfigError::Invalid {
                        field: "stack.max_file_handles",
                        reason: "must be greater than zero",
                    });
                }
                LayerConfig::StorageDrive {
                    max_concurrent_requests,
                    ..
                } if max_concurrent_requests == 0 => {
                    return Err(ConfigError::Invalid {
                        field: "stack.max_concurrent_requests",
                        reason: "must be greater than zero",
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}
