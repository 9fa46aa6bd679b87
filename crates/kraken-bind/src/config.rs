//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 集中描述 Bind 传输的可调参数，默认值取自线上部署：虚拟链路 MTU 32688、
//!   服务端连接 10 秒硬截止、客户端会话 1 分钟硬截止；
//! - 允许宿主以 TOML 片段覆盖任意子集，未出现的字段回落到默认值。
//!
//! ## 契约（What）
//! - [`BindConfig::from_toml_str`] 解析后立即执行 [`BindConfig::validate`]；
//! - 零值的 MTU、超时与队列深度均视为非法。

use std::time::Duration;

use serde::Deserialize;

use crate::error::BindError;

/// 虚拟链路 MTU 默认值。
pub const DEFAULT_MTU: usize = 32688;

/// Bind 传输配置。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BindConfig {
    /// 虚拟链路 MTU，同时是读缓冲大小与最大帧长。
    pub mtu: usize,
    /// 服务端每条连接的硬截止（毫秒），从接受时刻起算。
    pub server_session_timeout_ms: u64,
    /// 客户端会话的硬截止（毫秒），从 `open` 时刻起算。
    pub client_session_timeout_ms: u64,
    /// 共享入站队列深度。
    pub inbound_queue_depth: usize,
    /// 每条连接回复通道深度。
    pub reply_queue_depth: usize,
    /// 端点规范化缓存容量。
    pub endpoint_cache_capacity: usize,
    /// Sink 映射达到该规模时，登记新 Sink 前清理已结束的条目。
    pub sink_prune_threshold: usize,
    /// 会合路径。
    pub ws_path: String,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            server_session_timeout_ms: 10_000,
            client_session_timeout_ms: 60_000,
            inbound_queue_depth: 1,
            reply_queue_depth: 1,
            endpoint_cache_capacity: 1024,
            sink_prune_threshold: 1024,
            ws_path: "/ws".to_owned(),
        }
    }
}

impl BindConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, BindError> {
        let config: Self = toml::from_str(text).map_err(|err| BindError::Config {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BindError> {
        let checks = [
            (self.mtu == 0, "mtu must be positive"),
            (
                self.server_session_timeout_ms == 0,
                "server_session_timeout_ms must be positive",
            ),
            (
                self.client_session_timeout_ms == 0,
                "client_session_timeout_ms must be positive",
            ),
            (
                self.inbound_queue_depth == 0,
                "inbound_queue_depth must be positive",
            ),
            (
                self.reply_queue_depth == 0,
                "reply_queue_depth must be positive",
            ),
            (
                !self.ws_path.starts_with('/'),
                "ws_path must start with `/`",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, detail)) => Err(BindError::Config {
                detail: (*detail).to_owned(),
            }),
            None => Ok(()),
        }
    }

    pub fn server_session_timeout(&self) -> Duration {
        Duration::from_millis(self.server_session_timeout_ms)
    }

    pub fn client_session_timeout(&self) -> Duration {
        Duration::from_millis(self.client_session_timeout_ms)
    }
}
