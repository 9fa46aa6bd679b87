#![doc = r#"
# kraken-bind

## 设计动机（Why）
- **定位**：为加密隧道引擎提供一对可插拔的数据报传输（Bind），让隧道流量改走
  面向连接的双工介质（例如 WebSocket），从而穿越只放行 HTTP(S) 的网络。
- **架构角色**：向上实现引擎的 [`Bind`]/[`Receiver`]/[`Endpoint`] 接缝，向下只依赖
  [`Duplex`]/[`Dialer`] 抽象，具体介质由独立 crate 提供。
- **设计理念**：每条物理连接、每个客户端会话都由一个 [`SessionContext`] 管理生命周期，
  所有跨任务交接都与取消竞争，永不无界阻塞。

## 核心契约（What）
- **服务端**：一个共享 [`ServerBind`] 服务全部连接；每条连接由一个 [`Bridge`] 驱动，
  入站数据报汇入共享队列，出站回复按端点路由到“最近一次出现该端点”的连接；
- **客户端**：[`ClientBind`] 在首次发送时懒拨号，并发首发只产生一次拨号；
  在连接建立前调用的接收方会等待连接或会话结束；
- **端点**：[`WsEndpoint`] 为不可变值，经 [`EndpointCache`] 规范化后同地址共享实例。

## 实现策略（How）
- **执行框架**：Tokio；取消令牌取自 `tokio_util::sync::CancellationToken`，
  截止时间使用 Tokio 单调时钟；
- **并发原语**：端点到 Sink 的映射使用 `parking_lot::RwLock`，规范化缓存使用 `DashMap`，
  连接阶段通过 `tokio::sync::watch` 广播；
- **可观测性**：连接建立/拆除以 `tracing` 的 `info` 级别记录，逐包路径仅在 `debug` 级别记录。

## 风险与考量（Trade-offs）
- **Sink 生命周期**：连接关闭后映射条目不会立即删除，只会被覆盖或在达到阈值时批量清理；
  因此对已关闭连接的 `send` 返回 `Closed` 而非 `SinkNotFound`。
- **硬截止**：服务端连接与客户端会话的时长均从建立时刻计算，长连接需要由引擎重新建立。
"#]

pub mod bridge;
pub mod client;
pub mod config;
pub mod conn;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod memory;
pub mod server;

pub use bridge::{Admission, Bridge, BridgeOutcome};
pub use client::{ClientBind, ClientPhase};
pub use config::{BindConfig, DEFAULT_MTU};
pub use conn::{
    Bind, DialRequest, Dialer, Duplex, Endpoint, FrameReader, FrameWriter, Opened, PeerRegistry,
    Receiver, SharedEndpoint,
};
pub use context::SessionContext;
pub use endpoint::{EndpointCache, WsEndpoint};
pub use error::{BindError, ErrorKind};
pub use identity::{AllowedAddress, HandshakeParams, PeerIdentity, PeerKey};
pub use server::{InboundMessage, InboundQueue, ResponseSink, ServerBind, SinkRegistry};
