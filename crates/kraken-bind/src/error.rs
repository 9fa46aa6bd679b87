//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为 Bind 传输对外暴露的错误语义提供集中定义，供隧道引擎与 Bridge 统一处理；
//! - 区分“目的端已消失”（[`BindError::Closed`]）与“本地 I/O 故障”（[`BindError::Io`]），
//!   让调用方无需解析字符串即可决定是放弃该对端还是上报故障。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，可安全跨线程传播；
//! - 每个变体拥有稳定错误码（`kraken.bind.*`），便于日志检索与告警聚合；
//! - 路由错误（类型不符、未找到 Sink）只作为普通返回值，绝不触发 panic。

use std::io;

use thiserror::Error;

/// 错误的粗粒度分类。
///
/// - **意图 (Why)**：调用方通常只关心“是否应放弃该对端”“是否为本地故障”，
///   通过分类避免逐个匹配变体。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// 目的端或会话已结束，需要新的连接/会话。
    Closed,
    /// 双工连接上的本地 I/O 故障。
    Io,
    /// 发送路由失败（端点类型不符或未登记）。
    Routing,
    /// 身份凭据、虚拟地址或端点文本无法解析。
    Identity,
    /// 配置非法。
    Config,
    /// 上游引擎拒绝登记对端。
    Engine,
}

/// Bind 传输的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合端点解析、路由、会话生命周期与介质 I/O 的全部失败路径；
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`；
///   - [`BindError::code`] 返回稳定错误码，[`BindError::kind`] 返回粗粒度分类；
/// - **设计权衡 (Trade-offs)**：上下文以 `String` 保存，牺牲少量堆分配换取可读性。
#[derive(Debug, Error)]
pub enum BindError {
    /// 端点文本不是合法的 `address:port` 形式。
    #[error("invalid endpoint `{input}`: {reason}")]
    InvalidEndpoint { input: String, reason: String },

    /// 传入的端点不是本传输产出的端点类型。
    #[error("wrong endpoint type")]
    WrongEndpointKind,

    /// 未找到与端点对应的响应 Sink。
    #[error("response sink for `{endpoint}` no longer exists")]
    SinkNotFound { endpoint: String },

    /// 连接或会话已关闭，通常意味着与取消信号的竞争失败。
    #[error("use of closed network connection")]
    Closed,

    /// 身份凭据（公钥）格式非法。
    #[error("invalid peer credential: {reason}")]
    InvalidCredential { reason: String },

    /// 声明的虚拟地址非法。
    #[error("invalid virtual address `{input}`")]
    InvalidVirtualAddress { input: String },

    /// 读取到超过虚拟链路 MTU 的帧。
    #[error("frame of {len} bytes exceeds link mtu {mtu}")]
    FrameTooLarge { len: usize, mtu: usize },

    /// 上游引擎拒绝登记对端。
    #[error("peer registration failed: {detail}")]
    PeerRegistration { detail: String },

    /// 拨号建立连接失败。
    #[error("dial `{target}` failed: {detail}")]
    Dial { target: String, detail: String },

    /// 双工连接上的 I/O 故障。
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// 配置校验或解析失败。
    #[error("invalid bind configuration: {detail}")]
    Config { detail: String },
}

impl BindError {
    /// 构造带操作名的 I/O 错误。
    pub fn io(op: &'static str, source: io::Error) -> Self {
        BindError::Io { op, source }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BindError::InvalidEndpoint { .. } => "kraken.bind.endpoint.invalid",
            BindError::WrongEndpointKind => "kraken.bind.endpoint.wrong_kind",
            BindError::SinkNotFound { .. } => "kraken.bind.sink.not_found",
            BindError::Closed => "kraken.bind.closed",
            BindError::InvalidCredential { .. } => "kraken.bind.identity.credential",
            BindError::InvalidVirtualAddress { .. } => "kraken.bind.identity.address",
            BindError::FrameTooLarge { .. } => "kraken.bind.frame.too_large",
            BindError::PeerRegistration { .. } => "kraken.bind.engine.registration",
            BindError::Dial { .. } => "kraken.bind.dial_failed",
            BindError::Io { .. } => "kraken.bind.io",
            BindError::Config { .. } => "kraken.bind.config",
        }
    }

    /// 粗粒度分类。
    pub fn kind(&self) -> ErrorKind {
        match self {
            BindError::Closed => ErrorKind::Closed,
            BindError::Io { .. } | BindError::FrameTooLarge { .. } | BindError::Dial { .. } => {
                ErrorKind::Io
            }
            BindError::WrongEndpointKind | BindError::SinkNotFound { .. } => ErrorKind::Routing,
            BindError::InvalidEndpoint { .. }
            | BindError::InvalidCredential { .. }
            | BindError::InvalidVirtualAddress { .. } => ErrorKind::Identity,
            BindError::Config { .. } => ErrorKind::Config,
            BindError::PeerRegistration { .. } => ErrorKind::Engine,
        }
    }

    /// 是否表示“目的端已消失”。
    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::Closed
    }
}
