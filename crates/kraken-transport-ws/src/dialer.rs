use async_trait::async_trait;
use kraken_bind::{BindError, DEFAULT_MTU, DialRequest, Dialer};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, connect_async_with_config};
use tracing::debug;

use crate::connection::{WsConnection, ws_config};

/// 客户端拨号器：向会合服务器发起 WebSocket 升级。
///
/// - **契约 (What)**：目标 URL 为 `ws://{target}{path}?pub=<url-base64>&addr=<虚拟地址>`，
///   身份参数随升级请求一并提交；消息上限为虚拟链路 MTU。
#[derive(Clone, Debug)]
pub struct WsDialer {
    mtu: usize,
}

impl WsDialer {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    /// 拨号请求对应的会合 URL。
    pub fn url(request: &DialRequest) -> String {
        format!(
            "ws://{}{}?{}",
            request.target,
            request.path,
            request.query()
        )
    }
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

#[async_trait]
impl Dialer for WsDialer {
    type Conn = WsConnection<MaybeTlsStream<TcpStream>>;

    async fn dial(&self, request: &DialRequest) -> Result<Self::Conn, BindError> {
        let url = Self::url(request);
        debug!(%url, "websocket dial");
        let (stream, response) =
            connect_async_with_config(url.as_str(), Some(ws_config(self.mtu)), true)
                .await
                .map_err(|err| BindError::Dial {
                    target: request.target.clone(),
                    detail: err.to_string(),
                })?;
        debug!(status = %response.status(), "websocket upgraded");
        Ok(WsConnection::new(stream))
    }
}
