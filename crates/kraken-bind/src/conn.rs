//! # conn 模块说明
//!
//! ## 角色定位（Why）
//! - 描述本 crate 与两类外部协作者之间的接缝：
//!   1. 上游加密隧道引擎：消费 [`Bind`]/[`Receiver`]/[`Endpoint`]，并暴露 [`PeerRegistry`]；
//!   2. 物理介质：以 [`Duplex`]/[`FrameReader`]/[`FrameWriter`]/[`Dialer`] 抽象任意“一帧一数据报”的双工连接。
//! - 引擎与介质都只依赖这些 trait，WebSocket、内存管道等实现可以互换。
//!
//! ## 契约（What）
//! - 帧是不透明的二进制数据报，介质本身负责帧边界，不附加长度前缀；
//! - 所有 `async` 方法都可能被取消（Future 被丢弃），实现方不得因此泄露半写状态之外的资源。

use std::{any::Any, fmt, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::BindError,
    identity::{AllowedAddress, PeerKey},
};

/// 引擎视角下的远端身份。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 引擎只通过该 trait 推理“包来自谁、发往谁”，不关心底层介质；
///
/// ## 契约 (What)
/// - `src_*` 系列仅用于诊断：双工介质没有“每包本地源地址”的概念，
///   因此 [`Endpoint::src_ip`] 始终返回 `None`，[`Endpoint::src_to_string`] 返回空串；
/// - [`Endpoint::as_any`] 供 `Bind::send` 做类型检查。
pub trait Endpoint: fmt::Debug + Send + Sync + 'static {
    /// 清除缓存的源地址；无源地址概念的实现为空操作。
    fn clear_src(&self);
    fn src_to_string(&self) -> String;
    fn dst_to_string(&self) -> String;
    /// 目的地址的线格式字节，相等性与其保持一致。
    fn dst_to_bytes(&self) -> Vec<u8>;
    fn dst_ip(&self) -> IpAddr;
    fn src_ip(&self) -> Option<IpAddr>;
    fn as_any(&self) -> &dyn Any;
}

/// 在引擎与传输之间流转的共享端点句柄。
pub type SharedEndpoint = Arc<dyn Endpoint>;

/// 引擎持有的接收函数。
///
/// - **契约 (What)**：单消费者；引擎以紧凑循环调用 `receive`，
///   返回写入 `buf` 的字节数与来源端点。
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn receive(&self, buf: &mut [u8]) -> Result<(usize, SharedEndpoint), BindError>;
}

/// `Bind::open` 的结果：接收函数集合与实际绑定端口。
pub struct Opened {
    pub receivers: Vec<Box<dyn Receiver>>,
    pub port: u16,
}

impl fmt::Debug for Opened {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opened")
            .field("receivers", &self.receivers.len())
            .field("port", &self.port)
            .finish()
    }
}

/// 可插拔的数据报传输（Bind）。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把引擎与物理介质解耦：引擎以“端口 + 端点”收发数据报，实现方可以是 UDP，
///   也可以是本 crate 提供的服务端/客户端双工传输。
///
/// ## 契约 (What)
/// - `open`：返回接收函数与端口，不负责建立监听；
/// - `send`：按端点路由，任何情况下都不会越过所属取消上下文的生命周期阻塞；
/// - `close`/`set_mark`：允许为空操作。
#[async_trait]
pub trait Bind: Send + Sync {
    fn open(&self, port: u16) -> Result<Opened, BindError>;
    async fn close(&self) -> Result<(), BindError>;
    async fn send(&self, payload: &[u8], endpoint: &SharedEndpoint) -> Result<(), BindError>;
    fn set_mark(&self, mark: u32) -> Result<(), BindError>;
    fn parse_endpoint(&self, text: &str) -> Result<SharedEndpoint, BindError>;
}

/// 引擎的对端表，由 Bridge 在连接建立/拆除时调用。
pub trait PeerRegistry: Send + Sync + 'static {
    /// 以凭据登记对端，并把 `allowed` 作为其允许的虚拟地址。
    fn add_peer(&self, key: &PeerKey, allowed: AllowedAddress) -> Result<(), BindError>;
    /// 按凭据移除对端；对端不存在时为空操作。
    fn remove_peer(&self, key: &PeerKey);
}

/// 双工连接的读半部。
#[async_trait]
pub trait FrameReader: Send {
    /// 读取一帧；对端关闭时返回 [`BindError::Closed`]。
    async fn read_frame(&mut self) -> Result<Bytes, BindError>;
}

/// 双工连接的写半部。
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), BindError>;
    /// 关闭连接；重复调用应返回 `Ok(())` 或 [`BindError::Closed`]。
    async fn close(&mut self) -> Result<(), BindError>;
}

/// 可拆分为独立读写半部的双工连接。
pub trait Duplex: Send + 'static {
    type Reader: FrameReader + 'static;
    type Writer: FrameWriter + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// 客户端拨号请求：会合目标与随连接建立一并提交的身份参数。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DialRequest {
    /// 会合服务器的 `host:port`。
    pub target: String,
    /// 会合路径，例如 `/ws`。
    pub path: String,
    pub key: PeerKey,
    pub virtual_addr: IpAddr,
}

impl DialRequest {
    /// 拨号参数的查询串形式：`pub=<url-base64>&addr=<虚拟地址>`。
    pub fn query(&self) -> String {
        format!("pub={}&addr={}", self.key.to_url(), self.virtual_addr)
    }
}

/// 建立到会合服务器的双工连接。
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Duplex;

    async fn dial(&self, request: &DialRequest) -> Result<Self::Conn, BindError>;
}
