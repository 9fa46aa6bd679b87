use std::io;

use kraken_bind::BindError;
use tokio_tungstenite::tungstenite;

/// 介质层操作名，出现在 [`BindError::Io`] 的 `op` 字段中。
pub(crate) const BIND: &str = "ws bind";
pub(crate) const ACCEPT: &str = "ws accept";
pub(crate) const UPGRADE: &str = "ws upgrade";
pub(crate) const READ: &str = "ws read";
pub(crate) const WRITE: &str = "ws write";
pub(crate) const CLOSE: &str = "ws close";

/// 将 tungstenite 错误映射为 [`BindError`]。
///
/// - 连接已关闭（含重复关闭）统一视为 [`BindError::Closed`]，调用方据此区分“对端已走”与本地故障；
/// - 底层 IO 错误原样保留，其余协议错误包装为 `io::Error` 以保留错误链。
pub(crate) fn map_ws_error(op: &'static str, error: tungstenite::Error) -> BindError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            BindError::Closed
        }
        tungstenite::Error::Io(source) => BindError::io(op, source),
        other => BindError::io(op, io::Error::other(other)),
    }
}
