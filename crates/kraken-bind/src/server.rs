//! # server 模块说明
//!
//! ## 设计动机（Why）
//! - 服务端只有一个共享的 Bind 实例，却同时服务多条物理连接；
//!   入站方向由各 Bridge 汇入同一条入站队列，出站方向按端点路由到对应连接的 Sink。
//! - 引擎只认识端点，连接迁移（同一端点换了一条物理连接）必须对引擎透明。
//!
//! ## 核心契约（What）
//! - `receive`：单消费者；每收到一个数据报都会（重新）登记“端点 → Sink”，最近一次登记者胜出；
//! - `send`：类型检查 → 读锁查找 → 与 Sink 上下文竞争投递，永不无界阻塞；
//! - `close`/`set_mark`：不触碰任何连接，连接的关闭由 Bridge 负责。
//!
//! ## 风险与考量（Trade-offs）
//! - Sink 映射条目不会因连接关闭而被立即删除，只会被覆盖，或在映射达到
//!   `sink_prune_threshold` 时于登记路径上清理已结束的条目；
//!   因此连接关闭后的 `send` 返回 `Closed` 而非 `SinkNotFound`。

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;

use crate::{
    config::BindConfig,
    conn::{Bind, Opened, Receiver, SharedEndpoint},
    context::SessionContext,
    endpoint::{EndpointCache, WsEndpoint},
    error::BindError,
};

/// 把回复送达某一条物理连接写循环的句柄。
///
/// - **契约 (What)**：由恰好一个 Bridge 在其生命周期内持有发送端的接收侧；
///   `ctx` 即该连接的取消上下文。
#[derive(Clone, Debug)]
pub struct ResponseSink {
    data: mpsc::Sender<Bytes>,
    ctx: SessionContext,
}

impl ResponseSink {
    pub fn new(data: mpsc::Sender<Bytes>, ctx: SessionContext) -> Self {
        Self { data, ctx }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// 所属连接是否已结束。
    pub fn is_closed(&self) -> bool {
        self.ctx.is_done() || self.data.is_closed()
    }

    /// 投递一个回复，与连接上下文竞争。
    pub async fn deliver(&self, payload: Bytes) -> Result<(), BindError> {
        self.ctx
            .run(async {
                self.data
                    .send(payload)
                    .await
                    .map_err(|_| BindError::Closed)
            })
            .await
    }
}

/// Bridge 读到的一帧，附带来源端点与回复 Sink。
#[derive(Debug)]
pub struct InboundMessage {
    pub payload: Bytes,
    pub endpoint: Arc<WsEndpoint>,
    pub sink: ResponseSink,
}

/// 共享入站队列的生产端，每个 Bridge 持有一份克隆。
#[derive(Clone, Debug)]
pub struct InboundQueue {
    tx: mpsc::Sender<InboundMessage>,
}

impl InboundQueue {
    /// 入队，与 `ctx` 竞争，消费者停滞时不会永久阻塞读循环。
    pub async fn push(
        &self,
        message: InboundMessage,
        ctx: &SessionContext,
    ) -> Result<(), BindError> {
        ctx.run(async {
            self.tx
                .send(message)
                .await
                .map_err(|_| BindError::Closed)
        })
        .await
    }
}

/// “端点 → Sink” 的并发映射。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 发送路径高频读取、接收路径单写者覆盖，读写锁匹配这一访问模式；
///
/// ## 契约 (What)
/// - `register`：写锁下插入或覆盖，返回被覆盖的旧 Sink；
/// - `lookup`：读锁下克隆 Sink，锁不会跨越任何 `.await`；
/// - `prune_closed`：写锁下删除上下文已结束的条目。
#[derive(Debug)]
pub struct SinkRegistry {
    sinks: RwLock<HashMap<WsEndpoint, ResponseSink>>,
    prune_threshold: usize,
}

impl SinkRegistry {
    pub fn new(prune_threshold: usize) -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            prune_threshold: prune_threshold.max(1),
        }
    }

    pub fn register(&self, endpoint: WsEndpoint, sink: ResponseSink) -> Option<ResponseSink> {
        let mut sinks = self.sinks.write();
        if sinks.len() >= self.prune_threshold && !sinks.contains_key(&endpoint) {
            let before = sinks.len();
            sinks.retain(|_, existing| !existing.is_closed());
            debug!(pruned = before - sinks.len(), "pruned closed response sinks");
        }
        sinks.insert(endpoint, sink)
    }

    pub fn lookup(&self, endpoint: &WsEndpoint) -> Option<ResponseSink> {
        self.sinks.read().get(endpoint).cloned()
    }

    /// 删除所有已结束的条目，返回删除数量。
    pub fn prune_closed(&self) -> usize {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|_, sink| !sink.is_closed());
        before - sinks.len()
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }
}

#[derive(Debug)]
struct ServerInner {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: AsyncMutex<mpsc::Receiver<InboundMessage>>,
    sinks: SinkRegistry,
    endpoints: EndpointCache,
    // 最近一次 `open` 交出的接收函数所属的上下文。
    generation: Mutex<SessionContext>,
    config: BindConfig,
}

/// 服务端共享 Bind。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 一个实例服务全部连接：Bridge 通过 [`ServerBind::inbound`] 汇入数据报，
///   引擎通过 [`Bind::send`] 按端点回复；
///
/// ## 逻辑 (How)
/// - 内部以 `Arc` 共享状态，克隆代价为一次引用计数；
/// - 入站队列为有界 `mpsc`，接收端置于异步互斥锁内，体现单消费者约束；
///
/// ## 注意事项 (Trade-offs)
/// - `open` 本身不建立监听，监听与接受循环属于介质层。
#[derive(Clone, Debug)]
pub struct ServerBind {
    inner: Arc<ServerInner>,
}

impl ServerBind {
    pub fn new(config: BindConfig) -> Result<Self, BindError> {
        config.validate()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_depth);
        Ok(Self {
            inner: Arc::new(ServerInner {
                inbound_tx,
                inbound_rx: AsyncMutex::new(inbound_rx),
                sinks: SinkRegistry::new(config.sink_prune_threshold),
                endpoints: EndpointCache::new(config.endpoint_cache_capacity),
                generation: Mutex::new(SessionContext::new()),
                config,
            }),
        })
    }

    /// 供 Bridge 使用的入站队列句柄。
    pub fn inbound(&self) -> InboundQueue {
        InboundQueue {
            tx: self.inner.inbound_tx.clone(),
        }
    }

    pub fn endpoints(&self) -> &EndpointCache {
        &self.inner.endpoints
    }

    pub fn sinks(&self) -> &SinkRegistry {
        &self.inner.sinks
    }

    pub fn config(&self) -> &BindConfig {
        &self.inner.config
    }

    async fn receive(
        &self,
        ctx: &SessionContext,
        buf: &mut [u8],
    ) -> Result<(usize, SharedEndpoint), BindError> {
        let message = {
            let mut rx = self.inner.inbound_rx.lock().await;
            ctx.run(async { rx.recv().await.ok_or(BindError::Closed) })
                .await?
        };

        self.inner
            .sinks
            .register(*message.endpoint, message.sink);

        let len = message.payload.len().min(buf.len());
        if len < message.payload.len() {
            debug!(
                endpoint = %message.endpoint,
                datagram = message.payload.len(),
                buffer = buf.len(),
                "receive buffer shorter than datagram, truncating"
            );
        }
        buf[..len].copy_from_slice(&message.payload[..len]);
        let endpoint: SharedEndpoint = message.endpoint;
        Ok((len, endpoint))
    }
}

struct ServerReceiver {
    bind: ServerBind,
    ctx: SessionContext,
}

#[async_trait]
impl Receiver for ServerReceiver {
    async fn receive(&self, buf: &mut [u8]) -> Result<(usize, SharedEndpoint), BindError> {
        self.bind.receive(&self.ctx, buf).await
    }
}

#[async_trait]
impl Bind for ServerBind {
    fn open(&self, port: u16) -> Result<Opened, BindError> {
        let ctx = {
            let mut generation = self.inner.generation.lock();
            if generation.is_done() {
                *generation = SessionContext::new();
            }
            generation.clone()
        };
        Ok(Opened {
            receivers: vec![Box::new(ServerReceiver {
                bind: self.clone(),
                ctx,
            })],
            port,
        })
    }

    async fn close(&self) -> Result<(), BindError> {
        self.inner.generation.lock().cancel();
        Ok(())
    }

    async fn send(&self, payload: &[u8], endpoint: &SharedEndpoint) -> Result<(), BindError> {
        let endpoint = endpoint
            .as_any()
            .downcast_ref::<WsEndpoint>()
            .ok_or(BindError::WrongEndpointKind)?;
        let sink = self
            .inner
            .sinks
            .lookup(endpoint)
            .ok_or_else(|| BindError::SinkNotFound {
                endpoint: endpoint.to_string(),
            })?;
        sink.deliver(Bytes::copy_from_slice(payload))
            .await
            .inspect_err(|err| debug!(%endpoint, error = %err, "send to response sink failed"))
    }

    fn set_mark(&self, _mark: u32) -> Result<(), BindError> {
        Ok(())
    }

    fn parse_endpoint(&self, text: &str) -> Result<SharedEndpoint, BindError> {
        let endpoint: SharedEndpoint = self.inner.endpoints.parse(text)?;
        Ok(endpoint)
    }
}
