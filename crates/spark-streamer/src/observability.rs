//! 日志订阅器安装。
//!
//! 库本身只发出 `tracing` 事件，不主动安装订阅器；宿主程序或测试可调用
//! [`install_fmt_subscriber`] 获得带线程名的 `fmt` 输出。过滤规则读取 `RUST_LOG`，
//! 缺省为 `info`。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 安装全局订阅器失败。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstallError {
    /// 外部已设置全局 `tracing` 订阅器，不覆盖。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,

    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// 安装 `fmt + EnvFilter` 全局订阅器。
pub fn install_fmt_subscriber() -> Result<(), InstallError> {
    if dispatcher::has_been_set() {
        return Err(InstallError::SubscriberAlreadySet);
    }

    tracing_subscriber::registry()
        .with(build_env_filter())
        .with(fmt::layer().with_thread_names(true).with_target(true))
        .try_init()?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
