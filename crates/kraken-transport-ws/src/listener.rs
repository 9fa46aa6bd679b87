use std::net::SocketAddr;

use kraken_bind::{
    Admission, BindConfig, BindError, Bridge, ErrorKind, HandshakeParams, PeerRegistry,
    SessionContext,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};
use tracing::{debug, info, warn};

use crate::{
    connection::{WsConnection, ws_config},
    error::{self, map_ws_error},
};

/// 服务端监听器：接受 TCP 连接，完成 WebSocket 升级后把连接交给 [`Bridge`]。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 介质层只负责“接受 + 升级 + 提取握手参数”，连接接入共享 Bind 的全部语义由 Bridge 承担；
///
/// ## 逻辑 (How)
/// - `bind`：绑定 Tokio `TcpListener` 并记录实际地址；
/// - `serve`：循环接受连接，每条连接在独立任务中升级并运行 Bridge；
///   升级阶段受服务端会话超时约束，身份校验与对端登记在回应升级请求之前完成；
///
/// ## 契约 (What)
/// - `serve` 在 `shutdown` 结束时返回 `Ok(())`；已接入的连接以 `shutdown` 为父上下文，随之拆除；
/// - 单条连接的升级失败或被拒绝只记录日志，不影响接受循环。
#[derive(Debug)]
pub struct WsListener {
    inner: TcpListener,
    local_addr: SocketAddr,
    config: BindConfig,
}

impl WsListener {
    pub async fn bind(addr: SocketAddr, config: BindConfig) -> Result<Self, BindError> {
        config.validate()?;
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|err| BindError::io(error::BIND, err))?;
        let local_addr = inner
            .local_addr()
            .map_err(|err| BindError::io(error::BIND, err))?;
        Ok(Self {
            inner,
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 运行接受循环直至 `shutdown` 结束。
    pub async fn serve<R: PeerRegistry>(
        &self,
        bridge: Bridge<R>,
        shutdown: SessionContext,
    ) -> Result<(), BindError> {
        info!(addr = %self.local_addr, path = %self.config.ws_path, "websocket listener started");
        loop {
            let accepted = shutdown
                .run(async {
                    self.inner
                        .accept()
                        .await
                        .map_err(|err| BindError::io(error::ACCEPT, err))
                })
                .await;
            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(err) if err.is_closed() => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };

            let bridge = bridge.clone();
            let shutdown = shutdown.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let handshake = shutdown.child_with_timeout(config.server_session_timeout());
                let upgraded = handshake.run(upgrade(stream, &config, &bridge, remote)).await;
                let (conn, admission) = match upgraded {
                    Ok(upgraded) => upgraded,
                    Err(err) => {
                        debug!(%remote, error = %err, "websocket upgrade rejected");
                        return;
                    }
                };
                let outcome = bridge.run(conn, admission, remote, &shutdown).await;
                debug!(%remote, peer = %outcome.identity.key, "connection finished");
            });
        }
        info!(addr = %self.local_addr, "websocket listener stopped");
        Ok(())
    }
}

/// 完成服务端升级：在回应升级请求之前校验路径与身份并登记对端。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 路径不符回应 HTTP 404，身份参数非法回应 400，引擎拒绝登记回应 403，
///   三种情况客户端都只会看到拨号失败；
/// - 升级在回应之后失败时，随错误一并丢弃的 [`Admission`] 会移除刚登记的对端。
pub async fn upgrade<R: PeerRegistry>(
    stream: TcpStream,
    config: &BindConfig,
    bridge: &Bridge<R>,
    remote: SocketAddr,
) -> Result<(WsConnection<TcpStream>, Admission<R>), BindError> {
    let mut admitted = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() != config.ws_path {
            return Err(rejection(StatusCode::NOT_FOUND, "not found".to_owned()));
        }
        let params = HandshakeParams::from_query(request.uri().query().unwrap_or_default());
        match bridge.admit(&params, remote) {
            Ok(admission) => {
                admitted = Some(admission);
                Ok(response)
            }
            Err(err) if err.kind() == ErrorKind::Identity => {
                Err(rejection(StatusCode::BAD_REQUEST, err.to_string()))
            }
            Err(err) => Err(rejection(StatusCode::FORBIDDEN, err.to_string())),
        }
    };
    let stream = accept_hdr_async_with_config(stream, callback, Some(ws_config(config.mtu)))
        .await
        .map_err(|err| map_ws_error(error::UPGRADE, err))?;
    let admission = admitted.ok_or_else(|| BindError::PeerRegistration {
        detail: format!("upgrade from {remote} completed without admission"),
    })?;
    Ok((WsConnection::new(stream), admission))
}

fn rejection(status: StatusCode, body: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() = status;
    response
}
