//! # endpoint 模块说明
//!
//! ## 设计动机（Why）
//! - 引擎以端点（地址 + 端口）作为对端的稳定身份，并把它当作映射键反复比较与哈希；
//! - 热路径上的反复解析不应每次都分配新的端点实例，因此通过 [`EndpointCache`]
//!   规范化：相同地址与端口得到同一个 `Arc` 实例。
//!
//! ## 核心契约（What）
//! - [`WsEndpoint`] 为不可变值，相等性、哈希与线格式字节一致；
//! - 线格式：IPv4 为 4 字节、IPv6 为 16 字节地址，随后是小端序 2 字节端口；
//! - 源地址查询恒为“不支持”，只用于诊断，从不参与路由。
//!
//! ## 风险与考量（Trade-offs）
//! - 缓存由传输实例持有而非进程全局；达到容量上限时整体清空，
//!   以“偶尔重新分配”换取无界增长的消除。

use std::{
    any::Any,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use dashmap::DashMap;

use crate::{conn::Endpoint, error::BindError};

/// 双工介质上远端对端的身份。
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct WsEndpoint {
    addr: SocketAddr,
}

impl WsEndpoint {
    /// IPv6 的流标签与作用域不进入线格式，构造时一律清零。
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr: SocketAddr::new(addr.ip(), addr.port()),
        }
    }

    /// 解析 `address:port`，IPv6 地址需要方括号。
    pub fn parse(text: &str) -> Result<Self, BindError> {
        text.parse::<SocketAddr>()
            .map(Self::new)
            .map_err(|err| BindError::InvalidEndpoint {
                input: text.to_owned(),
                reason: err.to_string(),
            })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// 线格式编码。
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = match self.addr.ip() {
            IpAddr::V4(v4) => {
                let mut out = Vec::with_capacity(6);
                out.extend_from_slice(&v4.octets());
                out
            }
            IpAddr::V6(v6) => {
                let mut out = Vec::with_capacity(18);
                out.extend_from_slice(&v6.octets());
                out
            }
        };
        out.extend_from_slice(&self.addr.port().to_le_bytes());
        out
    }

    /// 线格式解码，长度只能是 6 或 18。
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, BindError> {
        let invalid = || BindError::InvalidEndpoint {
            input: hex::encode(bytes),
            reason: format!("unexpected wire length {}", bytes.len()),
        };
        let (ip, port) = match bytes.len() {
            6 => {
                let octets: [u8; 4] = bytes[..4].try_into().map_err(|_| invalid())?;
                (IpAddr::V4(Ipv4Addr::from(octets)), &bytes[4..])
            }
            18 => {
                let octets: [u8; 16] = bytes[..16].try_into().map_err(|_| invalid())?;
                (IpAddr::V6(Ipv6Addr::from(octets)), &bytes[16..])
            }
            _ => return Err(invalid()),
        };
        let port = u16::from_le_bytes([port[0], port[1]]);
        Ok(Self::new(SocketAddr::new(ip, port)))
    }
}

impl FromStr for WsEndpoint {
    type Err = BindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SocketAddr> for WsEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl fmt::Debug for WsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WsEndpoint({})", self.addr)
    }
}

impl fmt::Display for WsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

impl Endpoint for WsEndpoint {
    fn clear_src(&self) {}

    fn src_to_string(&self) -> String {
        String::new()
    }

    fn dst_to_string(&self) -> String {
        self.addr.to_string()
    }

    fn dst_to_bytes(&self) -> Vec<u8> {
        self.to_wire_bytes()
    }

    fn dst_ip(&self) -> IpAddr {
        self.addr.ip()
    }

    fn src_ip(&self) -> Option<IpAddr> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 端点规范化缓存。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让同一地址与端口的重复解析得到同一个 `Arc<WsEndpoint>`，
///   避免在每个数据报上重新分配端点；
///
/// ## 逻辑 (How)
/// - 内部以 `DashMap` 作为并发安全的借还式映射，按清零作用域后的 `SocketAddr` 查找；
/// - 插入前若条目数已达 `capacity`，先整体清空再插入。
///
/// ## 契约 (What)
/// - 容量内的重复输入必然返回 `Arc::ptr_eq` 相等的实例；
/// - 清空后首次查找会得到新实例，但与旧实例值相等。
#[derive(Debug)]
pub struct EndpointCache {
    entries: DashMap<SocketAddr, Arc<WsEndpoint>>,
    capacity: usize,
}

impl EndpointCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// 返回 `addr` 对应的规范实例。
    pub fn intern(&self, addr: SocketAddr) -> Arc<WsEndpoint> {
        let addr = WsEndpoint::new(addr).socket_addr();
        if let Some(existing) = self.entries.get(&addr) {
            return Arc::clone(existing.value());
        }
        if self.entries.len() >= self.capacity {
            self.entries.clear();
        }
        Arc::clone(
            self.entries
                .entry(addr)
                .or_insert_with(|| Arc::new(WsEndpoint::new(addr)))
                .value(),
        )
    }

    /// 解析文本并返回规范实例。
    pub fn parse(&self, text: &str) -> Result<Arc<WsEndpoint>, BindError> {
        let endpoint = WsEndpoint::parse(text)?;
        Ok(self.intern(endpoint.socket_addr()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
