//! 进程级日志安装入口。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher::{self, SetGlobalDefaultError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// 安装阶段的失败路径。
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// `install` 被重复调用。
    #[error("telemetry is already installed")]
    AlreadyInstalled,
    /// 外部提前设置了全局 `tracing` Subscriber。
    #[error("a global tracing subscriber is already set")]
    SubscriberAlreadySet,
    #[error("setting global tracing subscriber failed: {0}")]
    SetGlobalSubscriber(#[from] SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 全局 Subscriber。
///
/// # 教案式说明
/// - **意图（Why）**：宿主进程只需调用一次即可看到 Bridge 建立/拆除等连接级日志；
/// - **逻辑（How）**：过滤规则优先读取 `RUST_LOG`，缺省为 `info`；
/// - **契约（What）**：重复调用返回 [`TelemetryError::AlreadyInstalled`]，
///   外部已设置 Subscriber 时返回 [`TelemetryError::SubscriberAlreadySet`]，均不会 panic。
pub fn install() -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    INSTALLED
        .set(())
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
