//! 进程内双工连接：一对以有界 `mpsc` 相连的帧管道。
//!
//! 用于在同一进程内把 [`ClientBind`](crate::ClientBind) 直接接到
//! [`Bridge`](crate::Bridge)，也是集成测试的介质替身。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    conn::{DialRequest, Dialer, Duplex, FrameReader, FrameWriter},
    error::BindError,
};

/// 内存连接的一端。
#[derive(Debug)]
pub struct MemoryConn {
    reader: MemoryReader,
    writer: MemoryWriter,
}

/// 创建一对互连的内存连接。
pub fn pair(capacity: usize) -> (MemoryConn, MemoryConn) {
    let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
    (
        MemoryConn {
            reader: MemoryReader { rx: b_rx },
            writer: MemoryWriter { tx: Some(a_tx) },
        },
        MemoryConn {
            reader: MemoryReader { rx: a_rx },
            writer: MemoryWriter { tx: Some(b_tx) },
        },
    )
}

impl Duplex for MemoryConn {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

#[derive(Debug)]
pub struct MemoryReader {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<Bytes, BindError> {
        self.rx.recv().await.ok_or(BindError::Closed)
    }
}

#[derive(Debug)]
pub struct MemoryWriter {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), BindError> {
        let tx = self.tx.as_ref().ok_or(BindError::Closed)?;
        tx.send(frame).await.map_err(|_| BindError::Closed)
    }

    async fn close(&mut self) -> Result<(), BindError> {
        self.tx.take();
        Ok(())
    }
}

/// 每次拨号生成一对内存连接，把服务端一半连同拨号请求交给接受方。
#[derive(Clone, Debug)]
pub struct MemoryDialer {
    accepted: mpsc::UnboundedSender<(MemoryConn, DialRequest)>,
    capacity: usize,
    dials: Arc<AtomicUsize>,
}

impl MemoryDialer {
    /// 返回拨号器与接受端；接受端被丢弃后拨号失败。
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<(MemoryConn, DialRequest)>) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                capacity,
                dials: Arc::new(AtomicUsize::new(0)),
            },
            incoming,
        )
    }

    /// 迄今发起的拨号次数（含失败）。
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    type Conn = MemoryConn;

    async fn dial(&self, request: &DialRequest) -> Result<Self::Conn, BindError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = pair(self.capacity);
        self.accepted
            .send((remote, request.clone()))
            .map_err(|_| BindError::Dial {
                target: request.target.clone(),
                detail: "connection refused".to_owned(),
            })?;
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pair_and_close_ends_the_peer() {
        let (a, b) = pair(4);
        let (mut a_rx, mut a_tx) = a.split();
        let (mut b_rx, mut b_tx) = b.split();

        a_tx.write_frame(Bytes::from_static(b"ping")).await.expect("write");
        assert_eq!(b_rx.read_frame().await.expect("read"), "ping");
        b_tx.write_frame(Bytes::from_static(b"pong")).await.expect("write");
        assert_eq!(a_rx.read_frame().await.expect("read"), "pong");

        a_tx.close().await.expect("close");
        assert!(b_rx.read_frame().await.expect_err("closed").is_closed());
        assert!(a_tx.write_frame(Bytes::new()).await.is_err());
    }
}
