#![doc = r#"
# kraken-transport-ws

## 设计动机（Why）
- **定位**：为 `kraken-bind` 提供 WebSocket 介质，让隧道数据报以二进制消息的形式
  穿越只放行 HTTP(S) 的网络。
- **架构角色**：实现 [`Duplex`](kraken_bind::Duplex)/[`Dialer`](kraken_bind::Dialer)，
  并提供服务端接受循环，把每条升级后的连接交给 [`Bridge`](kraken_bind::Bridge)。

## 核心契约（What）
- **拨号**：`ws://{server}{path}?pub=<url-base64 公钥>&addr=<虚拟地址>`；
- **接受**：路径不符以 HTTP 404 拒绝；身份非法回应 400、登记被拒回应 403，均发生在升级完成之前；
- **消息**：一条二进制消息承载一个数据报，消息上限等于虚拟链路 MTU。

## 实现策略（How）
- **执行框架**：`tokio-tungstenite` 完成升级与分帧，`futures-util` 拆分读写半部；
- **错误映射**：连接关闭映射为 `BindError::Closed`，其余协议/IO 错误保留为 `BindError::Io`；
- **日志**：[`telemetry::install`] 安装 `fmt + EnvFilter` 全局 Subscriber。

## 风险与考量（Trade-offs）
- **明文传输**：介质层不启用 TLS，机密性由上层隧道保证；
- **升级超时**：升级阶段沿用服务端会话超时，慢速握手会占用一个任务直至超时。
"#]

mod connection;
mod dialer;
mod error;
mod listener;
pub mod telemetry;

pub use connection::{WsConnection, WsReader, WsWriter};
pub use dialer::WsDialer;
pub use listener::{WsListener, upgrade};
pub use telemetry::TelemetryError;
