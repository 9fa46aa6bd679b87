//! # identity 模块说明
//!
//! ## 角色定位（Why）
//! - 连接握手阶段携带两项身份参数：对端公钥凭据与其声明的虚拟地址；
//!   Bridge 必须先把它们校验为可路由的形式，再去登记引擎对端表。
//! - 所有解析都发生在状态变更之前：任何一项非法，连接建立立即中止。
//!
//! ## 编码约定（What）
//! - 凭据为 32 字节公钥；配置文件中以标准 base64（带填充）出现，
//!   拨号 URL 中以 URL-safe 无填充 base64 出现，引擎配置接口使用小写十六进制；
//! - 虚拟地址登记为主机路由（前缀长度等于地址位宽）。

use std::{fmt, net::IpAddr, str::FromStr};

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};

use crate::error::BindError;

/// 公钥长度（字节）。
pub const KEY_LEN: usize = 32;

/// 对端公钥凭据。
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct PeerKey([u8; KEY_LEN]);

impl PeerKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// 解析标准 base64（带填充）形式。
    pub fn from_base64(text: &str) -> Result<Self, BindError> {
        let raw = STANDARD
            .decode(text.trim())
            .map_err(|err| BindError::InvalidCredential {
                reason: err.to_string(),
            })?;
        Self::from_slice(&raw)
    }

    /// 解析 URL-safe 无填充 base64 形式（拨号参数中的形式）。
    pub fn from_url(text: &str) -> Result<Self, BindError> {
        let raw = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|err| BindError::InvalidCredential {
                reason: err.to_string(),
            })?;
        Self::from_slice(&raw)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn to_url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn from_slice(raw: &[u8]) -> Result<Self, BindError> {
        let bytes: [u8; KEY_LEN] =
            raw.try_into()
                .map_err(|_| BindError::InvalidCredential {
                    reason: format!("expected {KEY_LEN} bytes, got {}", raw.len()),
                })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerKey").field(&self.to_base64()).finish()
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for PeerKey {
    type Err = BindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

/// 允许对端使用的虚拟地址前缀。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AllowedAddress {
    addr: IpAddr,
    prefix_len: u8,
}

impl AllowedAddress {
    /// 以地址构造主机路由。
    pub fn host(addr: IpAddr) -> Self {
        let prefix_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl fmt::Display for AllowedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// 握手阶段收到的原始参数。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HandshakeParams {
    /// URL-safe 无填充 base64 公钥。
    pub pub_key: String,
    /// 对端声明的虚拟地址文本。
    pub addr: String,
}

impl HandshakeParams {
    /// 从 `a=b&c=d` 形式的查询串中提取 `pub` 与 `addr`。
    ///
    /// 未出现的参数保留为空串，留给 [`PeerIdentity::from_params`] 拒绝。
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for pair in query.split('&') {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                "pub" => params.pub_key = value.to_owned(),
                "addr" => params.addr = percent_decode(value),
                _ => {}
            }
        }
        params
    }
}

/// 校验通过的对端身份。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeerIdentity {
    pub key: PeerKey,
    pub allowed: AllowedAddress,
}

impl PeerIdentity {
    /// 解析并校验握手参数。
    pub fn from_params(params: &HandshakeParams) -> Result<Self, BindError> {
        let key = PeerKey::from_url(&params.pub_key)?;
        let addr: IpAddr =
            params
                .addr
                .parse()
                .map_err(|_| BindError::InvalidVirtualAddress {
                    input: params.addr.clone(),
                })?;
        Ok(Self {
            key,
            allowed: AllowedAddress::host(addr),
        })
    }
}

// 查询串里的 IPv6 地址可能被客户端转义为 `%3A`；`+` 按表单编码还原为空格，
// 非法转义原样保留，交给地址解析拒绝。
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%'
            && let Some(digits) = value.get(idx + 1..idx + 3)
            && digits.bytes().all(|b| b.is_ascii_hexdigit())
            && let Ok(byte) = u8::from_str_radix(digits, 16)
        {
            out.push(byte);
            idx += 3;
            continue;
        }
        out.push(if bytes[idx] == b'+' { b' ' } else { bytes[idx] });
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
