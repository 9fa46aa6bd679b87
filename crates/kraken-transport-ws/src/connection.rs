use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use kraken_bind::{BindError, Duplex, FrameReader, FrameWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Message, protocol::WebSocketConfig},
};
use tracing::trace;

use crate::error::{self, map_ws_error};

/// 单条 WebSocket 消息的上限配置：消息与帧都不超过 `mtu`。
pub(crate) fn ws_config(mtu: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(mtu);
    config.max_frame_size = Some(mtu);
    config
}

/// WebSocket 上的双工连接，一条二进制消息承载一个数据报。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让 Bridge 与客户端 Bind 以帧读写的方式使用 WebSocket，而不感知升级、掩码与控制帧；
///
/// ## 契约 (What)
/// - 读取只返回二进制消息；文本、Ping/Pong 与原始帧被跳过；
/// - 关闭帧或流结束返回 [`BindError::Closed`]；
/// - 写入总是发送二进制消息。
#[derive(Debug)]
pub struct WsConnection<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsConnection<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

impl<S> Duplex for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = WsReader<S>;
    type Writer = WsWriter<S>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.stream.split();
        (WsReader { stream }, WsWriter { sink })
    }
}

#[derive(Debug)]
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Bytes, BindError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                Some(Ok(Message::Close(_))) | None => return Err(BindError::Closed),
                Some(Ok(other)) => {
                    trace!(len = other.len(), "skipping non-binary websocket message");
                }
                Some(Err(err)) => return Err(map_ws_error(error::READ, err)),
            }
        }
    }
}

#[derive(Debug)]
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), BindError> {
        self.sink
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|err| map_ws_error(error::WRITE, err))
    }

    async fn close(&mut self) -> Result<(), BindError> {
        self.sink
            .close()
            .await
            .map_err(|err| map_ws_error(error::CLOSE, err))
    }
}
