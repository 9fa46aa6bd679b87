//! # client 模块说明
//!
//! ## 设计动机（Why）
//! - 客户端只与一个会合服务器通信，首次有数据要发送时才按需建立唯一一条物理连接；
//! - 引擎可能在连接存在之前就开始 `receive`，此时接收方需要等待“已连接”信号，
//!   而不是报错或空转。
//!
//! ## 核心契约（What）
//! - `open`：建立会话上下文（默认 1 分钟硬截止），返回一个接收函数；
//! - `send`：若尚未连接，在同一把锁内完成“检查 + 拨号”，并发首发只会拨号一次；
//!   拨号失败时保持未连接，下一次 `send` 重新拨号；
//! - `receive`：等待连接建立或会话结束，随后读取一帧并以“首个发送目标”作为来源端点；
//! - `close`：幂等，关闭现存连接并恰好取消一次会话上下文。
//!
//! ## 实现策略（How）
//! - 连接阶段 [`ClientPhase`] 通过 `tokio::sync::watch` 广播，接收方借此等待；
//! - 写半部与拨号共享 `state` 异步锁，读半部单独置于 `reader` 锁，读写互不阻塞；
//! - 会话上下文置于同步锁内，只在取用瞬间持有，不跨越 `.await`。

use std::{
    fmt,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, warn};

use crate::{
    config::BindConfig,
    conn::{
        Bind, DialRequest, Dialer, Duplex, FrameReader, FrameWriter, Opened, Receiver,
        SharedEndpoint,
    },
    context::SessionContext,
    endpoint::EndpointCache,
    error::BindError,
    identity::PeerKey,
};

/// 客户端连接阶段。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientPhase {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

type ReaderOf<D> = <<D as Dialer>::Conn as Duplex>::Reader;
type WriterOf<D> = <<D as Dialer>::Conn as Duplex>::Writer;

struct ReadHalf<R> {
    reader: R,
    // 首次发送时记录的目标端点，所有入站数据报都归属于它。
    endpoint: SharedEndpoint,
}

struct ClientState<W> {
    writer: Option<W>,
}

struct ClientInner<D: Dialer> {
    dialer: D,
    request: DialRequest,
    config: BindConfig,
    endpoints: EndpointCache,
    session: Mutex<Option<SessionContext>>,
    state: AsyncMutex<ClientState<WriterOf<D>>>,
    reader: AsyncMutex<Option<ReadHalf<ReaderOf<D>>>>,
    phase: watch::Sender<ClientPhase>,
    dials: AtomicUsize,
}

/// 客户端 Bind：懒拨号、单连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让引擎以普通 Bind 的方式使用一条出站双工连接，连接的建立时机完全由首次发送驱动；
///
/// ## 逻辑 (How)
/// - 状态机：`Unconnected → Connecting → Connected`，拨号失败回到 `Unconnected`，
///   `close` 进入 `Closed`，再次 `open` 回到 `Unconnected`；
/// - 拨号在 `state` 锁内完成，后到的 `send` 在锁上排队，醒来时看到的已是连接好的写半部；
///
/// ## 注意事项 (Trade-offs)
/// - 连接建立后的读写错误不会触发自动重连，交由引擎决定后续动作。
pub struct ClientBind<D: Dialer> {
    inner: Arc<ClientInner<D>>,
}

impl<D: Dialer> Clone for ClientBind<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> fmt::Debug for ClientBind<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBind")
            .field("target", &self.inner.request.target)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<D: Dialer> ClientBind<D> {
    /// 创建客户端 Bind；`target` 为会合服务器的 `host:port`。
    pub fn new(
        dialer: D,
        key: PeerKey,
        virtual_addr: IpAddr,
        target: impl Into<String>,
        config: BindConfig,
    ) -> Result<Self, BindError> {
        config.validate()?;
        let request = DialRequest {
            target: target.into(),
            path: config.ws_path.clone(),
            key,
            virtual_addr,
        };
        let (phase, _) = watch::channel(ClientPhase::Unconnected);
        Ok(Self {
            inner: Arc::new(ClientInner {
                dialer,
                request,
                endpoints: EndpointCache::new(config.endpoint_cache_capacity),
                config,
                session: Mutex::new(None),
                state: AsyncMutex::new(ClientState { writer: None }),
                reader: AsyncMutex::new(None),
                phase,
                dials: AtomicUsize::new(0),
            }),
        })
    }

    pub fn phase(&self) -> ClientPhase {
        *self.inner.phase.borrow()
    }

    pub fn dial_request(&self) -> &DialRequest {
        &self.inner.request
    }

    /// 迄今发起的拨号次数。
    pub fn dial_attempts(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    fn session(&self) -> Result<SessionContext, BindError> {
        self.inner.session.lock().clone().ok_or(BindError::Closed)
    }

    async fn connect(
        &self,
        state: &mut ClientState<WriterOf<D>>,
        session: &SessionContext,
        endpoint: &SharedEndpoint,
    ) -> Result<(), BindError> {
        let request = &self.inner.request;
        self.inner.phase.send_replace(ClientPhase::Connecting);
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        debug!(server = %request.target, path = %request.path, "dialing rendezvous server");

        let conn = match session.run(self.inner.dialer.dial(request)).await {
            Ok(conn) => conn,
            Err(err) => {
                self.inner.phase.send_replace(ClientPhase::Unconnected);
                warn!(server = %request.target, error = %err, "dial failed");
                return Err(err);
            }
        };

        let (reader, writer) = conn.split();
        state.writer = Some(writer);
        *self.inner.reader.lock().await = Some(ReadHalf {
            reader,
            endpoint: Arc::clone(endpoint),
        });
        self.inner.phase.send_replace(ClientPhase::Connected);
        info!(
            server = %request.target,
            endpoint = %endpoint.dst_to_string(),
            "connected to rendezvous server"
        );
        Ok(())
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<(usize, SharedEndpoint), BindError> {
        let session = self.session()?;
        let mut phase = self.inner.phase.subscribe();
        session
            .run(async {
                phase
                    .wait_for(|p| matches!(p, ClientPhase::Connected | ClientPhase::Closed))
                    .await
                    .map(|_| ())
                    .map_err(|_| BindError::Closed)
            })
            .await?;
        if self.phase() == ClientPhase::Closed {
            return Err(BindError::Closed);
        }

        let mut slot = self.inner.reader.lock().await;
        let half = slot.as_mut().ok_or(BindError::Closed)?;
        let frame = session.run(half.reader.read_frame()).await?;
        if frame.len() > self.inner.config.mtu {
            return Err(BindError::FrameTooLarge {
                len: frame.len(),
                mtu: self.inner.config.mtu,
            });
        }
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok((len, Arc::clone(&half.endpoint)))
    }
}

struct ClientReceiver<D: Dialer> {
    bind: ClientBind<D>,
}

#[async_trait]
impl<D: Dialer> Receiver for ClientReceiver<D> {
    async fn receive(&self, buf: &mut [u8]) -> Result<(usize, SharedEndpoint), BindError> {
        self.bind.receive(buf).await
    }
}

#[async_trait]
impl<D: Dialer> Bind for ClientBind<D> {
    fn open(&self, port: u16) -> Result<Opened, BindError> {
        let session = SessionContext::with_timeout(self.inner.config.client_session_timeout());
        *self.inner.session.lock() = Some(session);
        self.inner.phase.send_if_modified(|phase| {
            let reopened = *phase == ClientPhase::Closed;
            if reopened {
                *phase = ClientPhase::Unconnected;
            }
            reopened
        });
        Ok(Opened {
            receivers: vec![Box::new(ClientReceiver { bind: self.clone() })],
            port,
        })
    }

    async fn close(&self) -> Result<(), BindError> {
        // 先取消会话，让停在读半部上的接收方让出 `reader` 锁。
        if let Some(session) = self.inner.session.lock().take() {
            session.cancel();
        }
        let mut state = self.inner.state.lock().await;
        let result = match state.writer.take() {
            Some(mut writer) => match writer.close().await {
                Err(BindError::Closed) => Ok(()),
                other => other,
            },
            None => Ok(()),
        };
        drop(state);
        self.inner.reader.lock().await.take();
        if self.inner.phase.send_replace(ClientPhase::Closed) != ClientPhase::Closed {
            info!(server = %self.inner.request.target, "client bind closed");
        }
        result
    }

    async fn send(&self, payload: &[u8], endpoint: &SharedEndpoint) -> Result<(), BindError> {
        let session = self.session()?;
        let mut state = self.inner.state.lock().await;
        if self.phase() == ClientPhase::Closed {
            return Err(BindError::Closed);
        }
        if state.writer.is_none() {
            self.connect(&mut state, &session, endpoint).await?;
        }
        let writer = state.writer.as_mut().ok_or(BindError::Closed)?;
        session
            .run(writer.write_frame(Bytes::copy_from_slice(payload)))
            .await
    }

    fn set_mark(&self, _mark: u32) -> Result<(), BindError> {
        Ok(())
    }

    fn parse_endpoint(&self, text: &str) -> Result<SharedEndpoint, BindError> {
        let endpoint: SharedEndpoint = self.inner.endpoints.parse(text)?;
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConn, MemoryDialer};
    use std::{net::Ipv4Addr, time::Duration};

    const KEY: &str = "kraKENyGAX30e06miiNHxAzFNHIKxunMdUCZnjPhTCU=";

    fn client(dialer: MemoryDialer) -> ClientBind<MemoryDialer> {
        ClientBind::new(
            dialer,
            PeerKey::from_base64(KEY).expect("key"),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            "rendezvous.test:8080",
            BindConfig::default(),
        )
        .expect("client")
    }

    /// 拨号前先等待一段时间的拨号器，用于放大并发首发的竞争窗口。
    struct SlowDialer {
        inner: MemoryDialer,
        delay: Duration,
    }

    #[async_trait]
    impl Dialer for SlowDialer {
        type Conn = MemoryConn;

        async fn dial(&self, request: &DialRequest) -> Result<Self::Conn, BindError> {
            tokio::time::sleep(self.delay).await;
            self.inner.dial(request).await
        }
    }

    #[tokio::test]
    async fn dial_request_carries_identity_query() {
        let (dialer, _incoming) = MemoryDialer::new(1);
        let client = client(dialer);
        let request = client.dial_request();
        assert_eq!(request.path, "/ws");
        assert_eq!(
            request.query(),
            "pub=kraKENyGAX30e06miiNHxAzFNHIKxunMdUCZnjPhTCU&addr=10.0.0.2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn receive_before_connect_ends_with_session() {
        let (dialer, _incoming) = MemoryDialer::new(1);
        let client = client(dialer);
        let opened = client.open(0).expect("open");

        let mut buf = [0u8; 32];
        let started = tokio::time::Instant::now();
        let err = opened.receivers[0].receive(&mut buf).await.expect_err("session expires");
        assert!(err.is_closed());
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(client.dial_attempts(), 0);
    }

    #[tokio::test]
    async fn parked_receive_wakes_once_first_send_connects() {
        let (dialer, mut incoming) = MemoryDialer::new(4);
        let client = client(dialer);
        let opened = client.open(0).expect("open");
        let parked = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let (len, from) = opened.receivers[0].receive(&mut buf).await?;
            Ok::<_, BindError>((buf[..len].to_vec(), from.dst_to_string()))
        });

        let server = client.parse_endpoint("192.0.2.1:51820").expect("endpoint");
        client.send(b"hello", &server).await.expect("send");
        assert_eq!(client.phase(), ClientPhase::Connected);

        let (conn, request) = incoming.recv().await.expect("dialed");
        assert_eq!(request.target, "rendezvous.test:8080");
        let (mut remote_rx, mut remote_tx) = conn.split();
        assert_eq!(remote_rx.read_frame().await.expect("frame"), "hello");
        remote_tx
            .write_frame(Bytes::from_static(b"world"))
            .await
            .expect("reply");

        let (payload, from) = parked.await.expect("task").expect("receive");
        assert_eq!(payload, b"world");
        assert_eq!(from, "192.0.2.1:51820");
    }

    #[tokio::test]
    async fn concurrent_first_sends_dial_exactly_once() {
        let (memory, mut incoming) = MemoryDialer::new(8);
        let dialer = SlowDialer {
            inner: memory.clone(),
            delay: Duration::from_millis(20),
        };
        let client = ClientBind::new(
            dialer,
            PeerKey::from_base64(KEY).expect("key"),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            "rendezvous.test:8080",
            BindConfig::default(),
        )
        .expect("client");
        let _opened = client.open(0).expect("open");
        let server = client.parse_endpoint("192.0.2.1:51820").expect("endpoint");

        let sends = (0..4).map(|i| {
            let client = client.clone();
            let server = Arc::clone(&server);
            tokio::spawn(async move { client.send(&[i], &server).await })
        });
        for send in sends.collect::<Vec<_>>() {
            send.await.expect("task").expect("send");
        }

        assert_eq!(memory.dial_count(), 1);
        assert_eq!(client.dial_attempts(), 1);
        let (conn, _) = incoming.recv().await.expect("one connection");
        assert!(incoming.try_recv().is_err());
        let (mut remote_rx, _remote_tx) = conn.split();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(remote_rx.read_frame().await.expect("frame")[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_dial_stays_unconnected_and_retries() {
        let (dialer, incoming) = MemoryDialer::new(1);
        drop(incoming);
        let client = client(dialer);
        let _opened = client.open(0).expect("open");
        let server = client.parse_endpoint("192.0.2.1:51820").expect("endpoint");

        let err = client.send(b"x", &server).await.expect_err("refused");
        assert!(matches!(err, BindError::Dial { .. }));
        assert_eq!(client.phase(), ClientPhase::Unconnected);

        client.send(b"y", &server).await.expect_err("refused again");
        assert_eq!(client.dial_attempts(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reopen_allows_new_session() {
        let (dialer, mut incoming) = MemoryDialer::new(1);
        let client = client(dialer);
        let _opened = client.open(0).expect("open");
        let server = client.parse_endpoint("192.0.2.1:51820").expect("endpoint");
        client.send(b"x", &server).await.expect("send");
        let (conn, _) = incoming.recv().await.expect("dialed");
        let (mut remote_rx, _remote_tx) = conn.split();

        client.close().await.expect("close");
        client.close().await.expect("second close");
        assert_eq!(client.phase(), ClientPhase::Closed);
        assert_eq!(remote_rx.read_frame().await.expect("queued frame"), "x");
        assert!(remote_rx.read_frame().await.expect_err("peer closed").is_closed());
        assert!(client.send(b"late", &server).await.expect_err("closed").is_closed());

        let _reopened = client.open(0).expect("reopen");
        assert_eq!(client.phase(), ClientPhase::Unconnected);
        client.send(b"again", &server).await.expect("send after reopen");
        assert_eq!(client.dial_attempts(), 2);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (dialer, mut incoming) = MemoryDialer::new(1);
        let config = BindConfig {
            mtu: 4,
            ..BindConfig::default()
        };
        let client = ClientBind::new(
            dialer,
            PeerKey::from_base64(KEY).expect("key"),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            "rendezvous.test:8080",
            config,
        )
        .expect("client");
        let opened = client.open(0).expect("open");
        let server = client.parse_endpoint("192.0.2.1:51820").expect("endpoint");
        client.send(b"x", &server).await.expect("send");

        let (conn, _) = incoming.recv().await.expect("dialed");
        let (_remote_rx, mut remote_tx) = conn.split();
        remote_tx
            .write_frame(Bytes::from_static(b"too long"))
            .await
            .expect("write");

        let mut buf = [0u8; 16];
        let err = opened.receivers[0].receive(&mut buf).await.expect_err("oversized");
        assert!(matches!(err, BindError::FrameTooLarge { len: 8, mtu: 4 }));
    }

    #[test]
    fn new_client_starts_unconnected() {
        let (dialer, _incoming) = MemoryDialer::new(1);
        assert_eq!(client(dialer).phase(), ClientPhase::Unconnected);
    }
}
