//! xtunneld/src/message.rs
//! Wire message registry and frame codec: `[tag:1][len:8 BE][json payload]`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TunnelError};

/// Generous cap on a single frame's payload, to keep a misbehaving peer
/// from driving an unbounded allocation.
const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

macro_rules! tag {
    ($name:ident => $n:expr) => {
        pub const $name: u8 = $n;
    };
}

tag!(TAG_LOGIN => 1);
tag!(TAG_LOGIN_RESP => 2);
tag!(TAG_NEW_WORK_CONN => 3);
tag!(TAG_REQ_WORK_CONN => 4);
tag!(TAG_START_WORK_CONN => 5);
tag!(TAG_NEW_PROXY => 6);
tag!(TAG_NEW_PROXY_RESP => 7);
tag!(TAG_UDP_PACKET => 8);
tag!(TAG_PING => 9);
tag!(TAG_PONG => 10);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    Tcp,
    Udp,
    Http,
    Https,
    Ftp,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Udp => "udp",
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Ftp => "ftp",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Login {
    pub run_id: String,
    pub pool_count: usize,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NewWorkConn {
    pub run_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReqWorkConn {}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StartWorkConn {
    pub proxy_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: ProxyType,
    pub remote_port: u16,
    pub use_encryption: bool,
    pub use_compression: bool,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub sub_domain: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub host_header_rewrite: String,
    #[serde(default)]
    pub http_user: String,
    #[serde(default)]
    pub http_pwd: String,
    #[serde(default)]
    pub remote_data_port: u16,
    #[serde(default)]
    pub ftp_cfg_proxy_name: String,
    pub run_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NewProxyResp {
    pub proxy_name: String,
    pub remote_port: u16,
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UdpPacket {
    pub local_addr: String,
    pub remote_addr: String,
    pub content: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Ping {}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Pong {}

#[derive(Debug, Clone)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    StartWorkConn(StartWorkConn),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    UdpPacket(UdpPacket),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    fn tag(&self) -> u8 {
        match self {
            Message::Login(_) => TAG_LOGIN,
            Message::LoginResp(_) => TAG_LOGIN_RESP,
            Message::NewWorkConn(_) => TAG_NEW_WORK_CONN,
            Message::ReqWorkConn(_) => TAG_REQ_WORK_CONN,
            Message::StartWorkConn(_) => TAG_START_WORK_CONN,
            Message::NewProxy(_) => TAG_NEW_PROXY,
            Message::NewProxyResp(_) => TAG_NEW_PROXY_RESP,
            Message::UdpPacket(_) => TAG_UDP_PACKET,
            Message::Ping(_) => TAG_PING,
            Message::Pong(_) => TAG_PONG,
        }
    }

    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Message::Login(m) => serde_json::to_vec(m),
            Message::LoginResp(m) => serde_json::to_vec(m),
            Message::NewWorkConn(m) => serde_json::to_vec(m),
            Message::ReqWorkConn(m) => serde_json::to_vec(m),
            Message::StartWorkConn(m) => serde_json::to_vec(m),
            Message::NewProxy(m) => serde_json::to_vec(m),
            Message::NewProxyResp(m) => serde_json::to_vec(m),
            Message::UdpPacket(m) => serde_json::to_vec(m),
            Message::Ping(m) => serde_json::to_vec(m),
            Message::Pong(m) => serde_json::to_vec(m),
        }
    }

    fn from_tagged(tag: u8, payload: &[u8]) -> Result<Message> {
        Ok(match tag {
            TAG_LOGIN => Message::Login(serde_json::from_slice(payload)?),
            TAG_LOGIN_RESP => Message::LoginResp(serde_json::from_slice(payload)?),
            TAG_NEW_WORK_CONN => Message::NewWorkConn(serde_json::from_slice(payload)?),
            TAG_REQ_WORK_CONN => Message::ReqWorkConn(serde_json::from_slice(payload)?),
            TAG_START_WORK_CONN => Message::StartWorkConn(serde_json::from_slice(payload)?),
            TAG_NEW_PROXY => Message::NewProxy(serde_json::from_slice(payload)?),
            TAG_NEW_PROXY_RESP => Message::NewProxyResp(serde_json::from_slice(payload)?),
            TAG_UDP_PACKET => Message::UdpPacket(serde_json::from_slice(payload)?),
            TAG_PING => Message::Ping(serde_json::from_slice(payload)?),
            TAG_PONG => Message::Pong(serde_json::from_slice(payload)?),
            other => return Err(TunnelError::ProtocolViolation(format!("unknown tag {other}"))),
        })
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        TunnelError::ProtocolViolation(e.to_string())
    }
}

/// Reads one tagged frame from `stream`. Returns `Err(Io(UnexpectedEof))`
/// wrapped in `TunnelError::Io` when the peer closes cleanly before a tag
/// byte arrives; callers distinguish this from a genuine protocol error.
pub async fn read_msg<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Message> {
    let tag = stream.read_u8().await?;
    let len = stream.read_u64().await?;
    if len > MAX_FRAME_LEN {
        return Err(TunnelError::ProtocolViolation(format!(
            "frame length {len} exceeds cap"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Message::from_tagged(tag, &buf)
}

pub async fn write_msg<W: AsyncWrite + Unpin>(stream: &mut W, msg: &Message) -> Result<()> {
    let payload = msg
        .to_json()
        .map_err(|e| TunnelError::ProtocolViolation(e.to_string()))?;
    let mut framed = Vec::with_capacity(9 + payload.len());
    framed.push(msg.tag());
    framed.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    framed.extend_from_slice(&payload);
    stream.write_all(&framed).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_new_proxy() {
        let msg = Message::NewProxy(NewProxy {
            proxy_name: "t".into(),
            proxy_type: ProxyType::Tcp,
            remote_port: 0,
            use_encryption: false,
            use_compression: false,
            custom_domains: vec![],
            sub_domain: String::new(),
            locations: vec![],
            host_header_rewrite: String::new(),
            http_user: String::new(),
            http_pwd: String::new(),
            remote_data_port: 0,
            ftp_cfg_proxy_name: String::new(),
            run_id: "X".into(),
        });

        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_msg(&mut cursor).await.unwrap();
        match decoded {
            Message::NewProxy(np) => {
                assert_eq!(np.proxy_name, "t");
                assert_eq!(np.run_id, "X");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_unknown_tag() {
        let mut buf = Vec::new();
        buf.push(200u8);
        buf.extend_from_slice(&2u64.to_be_bytes());
        buf.extend_from_slice(b"{}");
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_msg(&mut cursor).await.unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.push(TAG_PING);
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_msg(&mut cursor).await.unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
    }
}
