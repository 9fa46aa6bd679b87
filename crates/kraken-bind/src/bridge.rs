//! # bridge 模块说明
//!
//! ## 设计动机（Why）
//! - 服务端每接受一条物理连接就运行一个 Bridge：把该连接接入共享 [`ServerBind`]，
//!   并在连接存活期间让引擎认识这个对端。
//!
//! ## 核心契约（What）
//! - 身份参数在任何状态变更之前校验，非法即拒绝，不登记对端；
//! - 登记对端后无论以何种路径退出都会移除对端；
//! - 读循环与写循环共享一个连接上下文，任一方失败即取消上下文，另一方随之退出；
//! - 连接上下文从接受时刻起有硬截止，流量不会续期。
//!
//! ## 实现策略（How）
//! - 接纳与运行分为两步，有升级握手的介质可在回应握手之前完成接纳；
//! - 两个循环以 `tokio::join!` 在同一任务内并发推进，`run` 返回即代表连接已完全拆除；
//! - 对端移除借助 RAII 守卫，panic 与提前返回同样覆盖。

use std::{fmt, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::BindConfig,
    conn::{Duplex, FrameReader, FrameWriter, PeerRegistry},
    context::SessionContext,
    endpoint::WsEndpoint,
    error::BindError,
    identity::{HandshakeParams, PeerIdentity, PeerKey},
    server::{InboundMessage, InboundQueue, ResponseSink, ServerBind},
};

/// 一条连接结束的原因汇总。
#[derive(Debug)]
pub struct BridgeOutcome {
    pub identity: PeerIdentity,
    pub endpoint: WsEndpoint,
    /// 读循环的终止错误；对端正常关闭时为 [`BindError::Closed`]。
    pub read: BindError,
    /// 写循环的终止错误；因上下文结束而退出时为 [`BindError::Closed`]。
    pub write: BindError,
}

/// 连接到共享 Bind 的桥接器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“一条双工连接”翻译为“共享入站队列上的数据报 + 一个回复 Sink”；
///
/// ## 契约 (What)
/// - [`Bridge::admit`] 先于连接建立完成身份校验与登记，[`Bridge::run`] 在连接完全拆除后才返回；
/// - [`Bridge::serve`] 供无握手阶段的介质把两步合并调用。
pub struct Bridge<R: PeerRegistry> {
    bind: ServerBind,
    registry: Arc<R>,
}

impl<R: PeerRegistry> Clone for Bridge<R> {
    fn clone(&self) -> Self {
        Self {
            bind: self.bind.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<R: PeerRegistry> Bridge<R> {
    pub fn new(bind: ServerBind, registry: Arc<R>) -> Self {
        Self { bind, registry }
    }

    pub fn bind(&self) -> &ServerBind {
        &self.bind
    }

    pub fn config(&self) -> &BindConfig {
        self.bind.config()
    }

    /// 校验握手身份并登记对端，尚不触碰连接。
    ///
    /// # 教案式注释
    ///
    /// ## 意图 (Why)
    /// - 介质层在回应升级请求之前调用它，非法或被拒绝的对端拿不到成功的升级响应，
    ///   客户端因而看到拨号失败，而不是一条随即被丢弃的连接；
    ///
    /// ## 契约 (What)
    /// - 返回的 [`Admission`] 持有登记；在交给 [`Bridge::run`] 之前丢弃它同样会移除对端。
    pub fn admit(
        &self,
        params: &HandshakeParams,
        remote: SocketAddr,
    ) -> Result<Admission<R>, BindError> {
        let identity = PeerIdentity::from_params(params).inspect_err(|err| {
            warn!(%remote, error = %err, "rejecting connection with invalid identity");
        })?;
        self.registry
            .add_peer(&identity.key, identity.allowed)
            .inspect_err(|err| warn!(%remote, error = %err, "peer registration failed"))?;
        Ok(Admission {
            identity,
            guard: PeerGuard {
                registry: Arc::clone(&self.registry),
                key: identity.key,
            },
        })
    }

    /// 运行一条已接纳的连接直至其结束。
    ///
    /// # 教案式注释
    ///
    /// ## 逻辑 (How)
    /// 1. 从 `parent` 派生带服务端超时的连接上下文；
    /// 2. 拆分连接，建立回复通道与 Sink，并发运行读写循环；
    /// 3. 两个循环都退出后关闭写半部，随后释放登记守卫、移除对端。
    pub async fn run<C: Duplex>(
        &self,
        conn: C,
        admission: Admission<R>,
        remote: SocketAddr,
        parent: &SessionContext,
    ) -> BridgeOutcome {
        let Admission { identity, guard: _peer } = admission;

        let config = self.bind.config();
        let ctx = parent.child_with_timeout(config.server_session_timeout());
        let endpoint = self.bind.endpoints().intern(remote);
        let (reader, mut writer) = conn.split();
        let (reply_tx, reply_rx) = mpsc::channel(config.reply_queue_depth);
        let sink = ResponseSink::new(reply_tx, ctx.clone());
        info!(
            %remote,
            peer = %identity.key,
            allowed = %identity.allowed,
            "bridge established"
        );

        let (read, write) = tokio::join!(
            read_loop(
                reader,
                ReadTarget {
                    inbound: self.bind.inbound(),
                    endpoint: Arc::clone(&endpoint),
                    sink,
                    mtu: config.mtu,
                },
                &ctx,
            ),
            write_loop(&mut writer, reply_rx, &ctx),
        );
        if let Err(err) = writer.close().await
            && !err.is_closed()
        {
            debug!(%remote, error = %err, "closing connection failed");
        }
        info!(%remote, peer = %identity.key, read = %read, write = %write, "bridge closed");

        BridgeOutcome {
            identity,
            endpoint: *endpoint,
            read,
            write,
        }
    }

    /// 接纳并运行一条已建立的连接：[`Bridge::admit`] 之后接 [`Bridge::run`]。
    ///
    /// 返回 `Err` 仅表示身份校验或对端登记失败，此时连接未被接入，直接丢弃。
    pub async fn serve<C: Duplex>(
        &self,
        conn: C,
        params: &HandshakeParams,
        remote: SocketAddr,
        parent: &SessionContext,
    ) -> Result<BridgeOutcome, BindError> {
        let admission = self.admit(params, remote)?;
        Ok(self.run(conn, admission, remote, parent).await)
    }
}

/// 已通过校验并登记在册的对端。
pub struct Admission<R: PeerRegistry> {
    identity: PeerIdentity,
    guard: PeerGuard<R>,
}

impl<R: PeerRegistry> Admission<R> {
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }
}

impl<R: PeerRegistry> fmt::Debug for Admission<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

struct PeerGuard<R: PeerRegistry> {
    registry: Arc<R>,
    key: PeerKey,
}

impl<R: PeerRegistry> Drop for PeerGuard<R> {
    fn drop(&mut self) {
        self.registry.remove_peer(&self.key);
        debug!(peer = %self.key, "peer removed");
    }
}

struct ReadTarget {
    inbound: InboundQueue,
    endpoint: Arc<WsEndpoint>,
    sink: ResponseSink,
    mtu: usize,
}

async fn read_loop<Rd: FrameReader>(
    mut reader: Rd,
    target: ReadTarget,
    ctx: &SessionContext,
) -> BindError {
    let err = loop {
        let frame = match ctx.run(reader.read_frame()).await {
            Ok(frame) => frame,
            Err(err) => break err,
        };
        if frame.len() > target.mtu {
            break BindError::FrameTooLarge {
                len: frame.len(),
                mtu: target.mtu,
            };
        }
        let message = InboundMessage {
            payload: frame,
            endpoint: Arc::clone(&target.endpoint),
            sink: target.sink.clone(),
        };
        if let Err(err) = target.inbound.push(message, ctx).await {
            break err;
        }
    };
    ctx.cancel();
    err
}

async fn write_loop<W: FrameWriter>(
    writer: &mut W,
    mut replies: mpsc::Receiver<Bytes>,
    ctx: &SessionContext,
) -> BindError {
    let err = loop {
        let reply = match ctx
            .run(async { replies.recv().await.ok_or(BindError::Closed) })
            .await
        {
            Ok(reply) => reply,
            Err(err) => break err,
        };
        if let Err(err) = ctx.run(writer.write_frame(reply)).await {
            break err;
        }
    };
    ctx.cancel();
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conn::{Bind, SharedEndpoint},
        error::ErrorKind,
        identity::AllowedAddress,
        memory,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::{collections::HashMap, io, time::Duration};
    use tracing_test::traced_test;

    const KEY_URL: &str = "kraKENyGAX30e06miiNHxAzFNHIKxunMdUCZnjPhTCU";

    #[derive(Debug, Default)]
    struct RecordingRegistry {
        peers: Mutex<HashMap<PeerKey, AllowedAddress>>,
        removed: Mutex<Vec<PeerKey>>,
    }

    impl PeerRegistry for RecordingRegistry {
        fn add_peer(&self, key: &PeerKey, allowed: AllowedAddress) -> Result<(), BindError> {
            self.peers.lock().insert(*key, allowed);
            Ok(())
        }

        fn remove_peer(&self, key: &PeerKey) {
            self.peers.lock().remove(key);
            self.removed.lock().push(*key);
        }
    }

    /// 引擎拒绝一切登记。
    #[derive(Debug, Default)]
    struct RefusingRegistry {
        removed: Mutex<usize>,
    }

    impl PeerRegistry for RefusingRegistry {
        fn add_peer(&self, key: &PeerKey, _allowed: AllowedAddress) -> Result<(), BindError> {
            Err(BindError::PeerRegistration {
                detail: format!("peer {key} refused"),
            })
        }

        fn remove_peer(&self, _key: &PeerKey) {
            *self.removed.lock() += 1;
        }
    }

    /// 读半部来自内存管道，写半部每次写入都失败。
    struct BrokenPipeConn {
        reader: memory::MemoryReader,
    }

    struct BrokenPipeWriter;

    #[async_trait]
    impl FrameWriter for BrokenPipeWriter {
        async fn write_frame(&mut self, _frame: Bytes) -> Result<(), BindError> {
            Err(BindError::io("pipe write", io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        async fn close(&mut self) -> Result<(), BindError> {
            Ok(())
        }
    }

    impl Duplex for BrokenPipeConn {
        type Reader = memory::MemoryReader;
        type Writer = BrokenPipeWriter;

        fn split(self) -> (Self::Reader, Self::Writer) {
            (self.reader, BrokenPipeWriter)
        }
    }

    fn params(addr: &str) -> HandshakeParams {
        HandshakeParams {
            pub_key: KEY_URL.to_owned(),
            addr: addr.to_owned(),
        }
    }

    fn bridge(config: BindConfig) -> (Bridge<RecordingRegistry>, Arc<RecordingRegistry>) {
        let registry = Arc::new(RecordingRegistry::default());
        let bind = ServerBind::new(config).expect("server bind");
        (Bridge::new(bind, Arc::clone(&registry)), registry)
    }

    fn remote() -> SocketAddr {
        "198.51.100.20:40000".parse().expect("addr")
    }

    #[tokio::test]
    #[traced_test]
    async fn invalid_identity_is_rejected_before_registration() {
        let (bridge, registry) = bridge(BindConfig::default());
        let (server_side, _client_side) = memory::pair(1);

        let err = bridge
            .serve(server_side, &params("not-an-ip"), remote(), &SessionContext::new())
            .await
            .expect_err("bad addr");
        assert!(matches!(err, BindError::InvalidVirtualAddress { .. }));
        assert!(registry.peers.lock().is_empty());
        assert!(registry.removed.lock().is_empty());
        assert!(logs_contain("rejecting connection with invalid identity"));
    }

    #[test]
    fn refused_registration_is_reported_and_nothing_is_removed() {
        let registry = Arc::new(RefusingRegistry::default());
        let bind = ServerBind::new(BindConfig::default()).expect("server bind");
        let bridge = Bridge::new(bind, Arc::clone(&registry));

        let err = bridge.admit(&params("10.0.0.7"), remote()).expect_err("refused");
        assert!(matches!(err, BindError::PeerRegistration { .. }));
        assert_eq!(*registry.removed.lock(), 0);
    }

    #[test]
    fn dropping_an_unused_admission_removes_the_peer() {
        let (bridge, registry) = bridge(BindConfig::default());

        let admission = bridge.admit(&params("10.0.0.8"), remote()).expect("admitted");
        assert_eq!(admission.identity().allowed.to_string(), "10.0.0.8/32");
        assert_eq!(registry.peers.lock().len(), 1);

        drop(admission);
        assert!(registry.peers.lock().is_empty());
        assert_eq!(registry.removed.lock().len(), 1);
    }

    #[tokio::test]
    async fn datagrams_flow_both_ways_and_peer_is_removed_on_close() {
        let (bridge, registry) = bridge(BindConfig::default());
        let bind = bridge.bind().clone();
        let opened = bind.open(0).expect("open");
        let (server_side, client_side) = memory::pair(4);

        let serving = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .serve(server_side, &params("10.0.0.2"), remote(), &SessionContext::new())
                    .await
            })
        };

        let (mut client_rx, mut client_tx) = client_side.split();
        client_tx
            .write_frame(Bytes::from_static(b"handshake"))
            .await
            .expect("client write");
        let mut buf = [0u8; 64];
        let (len, from) = opened.receivers[0].receive(&mut buf).await.expect("receive");
        assert_eq!(&buf[..len], b"handshake");
        assert_eq!(from.dst_to_string(), "198.51.100.20:40000");
        assert_eq!(
            registry.peers.lock().values().next().map(ToString::to_string),
            Some("10.0.0.2/32".to_owned())
        );

        bind.send(b"response", &from).await.expect("send");
        assert_eq!(client_rx.read_frame().await.expect("reply"), "response");

        client_tx.close().await.expect("client close");
        let outcome = serving.await.expect("task").expect("served");
        assert!(outcome.read.is_closed());
        assert!(registry.peers.lock().is_empty());
        assert_eq!(registry.removed.lock().len(), 1);

        let err = bind.send(b"late", &from).await.expect_err("closed");
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn read_failure_cancels_write_loop_promptly() {
        let (bridge, _registry) = bridge(BindConfig::default());
        let (server_side, client_side) = memory::pair(1);
        let parent = SessionContext::new();

        let serving = {
            let bridge = bridge.clone();
            let parent = parent.clone();
            tokio::spawn(async move {
                bridge
                    .serve(server_side, &params("10.0.0.9"), remote(), &parent)
                    .await
            })
        };
        drop(client_side);

        let outcome = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("bridge exits promptly")
            .expect("task")
            .expect("served");
        assert!(outcome.read.is_closed());
        assert!(outcome.write.is_closed());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn write_failure_cancels_read_loop_promptly() {
        let (bridge, registry) = bridge(BindConfig::default());
        let bind = bridge.bind().clone();
        let opened = bind.open(0).expect("open");
        let (server_side, client_side) = memory::pair(4);
        let (server_rx, _server_tx) = server_side.split();

        let serving = {
            let bridge = bridge.clone();
            let conn = BrokenPipeConn { reader: server_rx };
            tokio::spawn(async move {
                bridge
                    .serve(conn, &params("10.0.0.5"), remote(), &SessionContext::new())
                    .await
            })
        };

        // 客户端写半部保持存活，读循环只能因上下文取消而退出。
        let (_client_rx, mut client_tx) = client_side.split();
        client_tx
            .write_frame(Bytes::from_static(b"initiation"))
            .await
            .expect("client write");
        let mut buf = [0u8; 32];
        let (_, from) = opened.receivers[0].receive(&mut buf).await.expect("receive");
        bind.send(b"response", &from).await.expect("queued");

        let outcome = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("bridge exits promptly")
            .expect("task")
            .expect("served");
        assert_eq!(outcome.write.kind(), ErrorKind::Io);
        assert!(outcome.read.is_closed(), "read ended with {:?}", outcome.read);
        assert!(registry.peers.lock().is_empty());
        assert_eq!(registry.removed.lock().len(), 1);
    }

    #[tokio::test]
    async fn oversized_frame_tears_down_connection() {
        let config = BindConfig {
            mtu: 8,
            ..BindConfig::default()
        };
        let (bridge, registry) = bridge(config);
        let (server_side, client_side) = memory::pair(1);
        let (_client_rx, mut client_tx) = client_side.split();
        client_tx
            .write_frame(Bytes::from_static(b"much too long"))
            .await
            .expect("write");

        let outcome = bridge
            .serve(server_side, &params("10.0.0.3"), remote(), &SessionContext::new())
            .await
            .expect("served");
        assert!(matches!(
            outcome.read,
            BindError::FrameTooLarge { len: 13, mtu: 8 }
        ));
        assert!(registry.peers.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_ends_at_hard_deadline_despite_traffic() {
        let (bridge, registry) = bridge(BindConfig::default());
        let bind = bridge.bind().clone();
        let opened = bind.open(0).expect("open");
        let (server_side, client_side) = memory::pair(4);
        let serving = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .serve(server_side, &params("10.0.0.4"), remote(), &SessionContext::new())
                    .await
            })
        };

        let (_client_rx, mut client_tx) = client_side.split();
        let started = tokio::time::Instant::now();
        let mut buf = [0u8; 16];
        let mut last: Option<SharedEndpoint> = None;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            client_tx
                .write_frame(Bytes::from_static(b"keepalive"))
                .await
                .expect("write");
            let (_, from) = opened.receivers[0].receive(&mut buf).await.expect("receive");
            last = Some(from);
        }

        let outcome = serving.await.expect("task").expect("served");
        assert!(outcome.read.is_closed());
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(registry.peers.lock().is_empty());
        let from = last.expect("received at least once");
        assert!(bind.send(b"late", &from).await.expect_err("expired").is_closed());
    }
}
