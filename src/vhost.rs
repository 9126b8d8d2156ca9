//! xtunneld/src/vhost.rs
//! Name-based virtual hosting for the shared HTTP/HTTPS listeners: peeks
//! enough of a connection to learn its `Host` (HTTP) or SNI (HTTPS), looks
//! up a registered route by host+path with a wildcard-subdomain fallback,
//! then replays the peeked bytes ahead of the live socket to whichever
//! proxy owns the route.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

const PEEK_CAP: usize = 8192;

/// A connection whose leading bytes have already been consumed for
/// routing purposes; reads first drain the captured prefix, then fall
/// through to the live socket.
pub struct SharedConn<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> SharedConn<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        SharedConn { prefix, pos: 0, inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SharedConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SharedConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Clone)]
pub struct VhostRoute {
    pub proxy_name: String,
    pub host_header_rewrite: String,
    pub http_user: String,
    pub http_pwd: String,
    pub sender: mpsc::UnboundedSender<SharedConn<TcpStream>>,
}

/// Routing table keyed by (lowercased host, lowercased path), with a
/// leftmost-label wildcard fallback (`foo.example.com` -> `*.example.com`)
/// matched against a single-level wildcard fallback rule.
pub struct VhostMuxer {
    routes: DashMap<(String, String), VhostRoute>,
}

impl VhostMuxer {
    pub fn new() -> Self {
        VhostMuxer {
            routes: DashMap::new(),
        }
    }

    pub fn register(&self, host: &str, path: &str, route: VhostRoute) -> Result<()> {
        let key = (host.to_lowercase(), normalize_path(path));
        match self.routes.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let (h, p) = entry.key();
                Err(TunnelError::AlreadyRegistered(format!("vhost route {h}{p}")))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(route);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, host: &str, path: &str) {
        let key = (host.to_lowercase(), normalize_path(path));
        self.routes.remove(&key);
    }

    fn lookup(&self, host: &str, path: &str) -> Option<VhostRoute> {
        let host = host.to_lowercase();
        let path = normalize_path(path);

        if let Some(route) = self.best_path_match(&host, &path) {
            return Some(route);
        }
        if let Some(wildcard) = wildcard_host(&host) {
            return self.best_path_match(&wildcard, &path);
        }
        None
    }

    fn best_path_match(&self, host: &str, path: &str) -> Option<VhostRoute> {
        let mut best: Option<(usize, VhostRoute)> = None;
        for entry in self.routes.iter() {
            let (h, p) = entry.key();
            if h != host {
                continue;
            }
            if path.starts_with(p.as_str()) {
                let better = best.as_ref().map(|(len, _)| p.len() > *len).unwrap_or(true);
                if better {
                    best = Some((p.len(), entry.value().clone()));
                }
            }
        }
        best.map(|(_, r)| r)
    }

    /// Accepts one raw connection on the shared listener, peeks its
    /// routing key, and hands it (prefixed with the bytes peeked) to the
    /// matched proxy's channel. Returns an error without touching the
    /// socket further if no route matches or auth fails.
    pub async fn handle(&self, mut conn: TcpStream, is_tls: bool, peek_timeout: Duration) -> Result<()> {
        let peeked = tokio::time::timeout(peek_timeout, peek_prefix(&mut conn))
            .await
            .map_err(|_| TunnelError::PeekTimeout)??;

        let (host, path) = if is_tls {
            let host = extract_sni(&peeked).ok_or_else(|| {
                TunnelError::ProtocolViolation("no SNI in TLS ClientHello".into())
            })?;
            (host, "/".to_string())
        } else {
            parse_http_host_path(&peeked)
                .ok_or_else(|| TunnelError::ProtocolViolation("no Host header".into()))?
        };

        let route = self
            .lookup(&host, &path)
            .ok_or_else(|| TunnelError::UnknownType(format!("no vhost route for {host}{path}")))?;

        if !route.http_user.is_empty() && !is_tls {
            check_basic_auth(&peeked, &route.http_user, &route.http_pwd)?;
        }

        let rewritten = if !route.host_header_rewrite.is_empty() && !is_tls {
            rewrite_host_header(&peeked, &route.host_header_rewrite)
        } else {
            peeked
        };

        let shared = SharedConn::new(rewritten, conn);
        route.sender.send(shared).map_err(|_| TunnelError::ControlClosed)?;
        debug!(host = host.as_str(), path = path.as_str(), "routed vhost connection");
        Ok(())
    }
}

impl Default for VhostMuxer {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if !path.starts_with('/') {
        format!("/{path}")
    } else {
        path.to_string()
    }
}

/// `foo.bar.example.com` -> `*.bar.example.com`; `example.com` (no
/// subdomain to drop) -> `None`.
fn wildcard_host(host: &str) -> Option<String> {
    let idx = host.find('.')?;
    let rest = &host[idx + 1..];
    if rest.contains('.') {
        Some(format!("*.{rest}"))
    } else {
        None
    }
}

async fn peek_prefix(conn: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; PEEK_CAP];
    let mut total = 0usize;
    loop {
        let n = conn.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
        if total >= PEEK_CAP {
            break;
        }
        if looks_complete(&buf[..total]) {
            break;
        }
    }
    buf.truncate(total);
    Ok(buf)
}

fn looks_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= 5 && buf[0] == 0x16
}

fn parse_http_host_path(buf: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(buf);
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
    let path = path.split('?').next().unwrap_or("/").to_string();

    let host = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("host") {
            Some(value.trim().split(':').next().unwrap_or("").to_string())
        } else {
            None
        }
    })?;

    Some((host, path))
}

fn check_basic_auth(buf: &[u8], user: &str, pwd: &str) -> Result<()> {
    let text = String::from_utf8_lossy(buf);
    let header = text.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("authorization") {
            Some(value.trim().to_string())
        } else {
            None
        }
    });

    let expected = format!("{user}:{pwd}");
    let expected_b64 = base64::engine::general_purpose::STANDARD.encode(expected.as_bytes());

    match header {
        Some(h) if h.strip_prefix("Basic ").map(|v| v == expected_b64).unwrap_or(false) => Ok(()),
        _ => {
            warn!("vhost basic auth failed");
            Err(TunnelError::AuthRequired)
        }
    }
}

fn rewrite_host_header(buf: &[u8], new_host: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(buf);
    let rewritten: Vec<String> = text
        .split("\r\n")
        .map(|line| {
            if let Some((name, _)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("host") {
                    return format!("Host: {new_host}");
                }
            }
            line.to_string()
        })
        .collect();
    rewritten.join("\r\n").into_bytes()
}

/// Minimal TLS ClientHello SNI extractor: enough to read the
/// `server_name` extension without a full TLS stack (TLS itself stays
/// out of scope; the muxer only ever reads, never terminates, the
/// handshake).
fn extract_sni(buf: &[u8]) -> Option<String> {
    if buf.len() < 5 || buf[0] != 0x16 {
        return None;
    }
    let mut pos = 5; // record header
    if pos + 4 > buf.len() {
        return None;
    }
    pos += 4; // handshake header (type + length)
    pos += 2; // client_version
    if pos + 32 > buf.len() {
        return None;
    }
    pos += 32; // random
    let session_id_len = *buf.get(pos)? as usize;
    pos += 1 + session_id_len;
    let cipher_suites_len = u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]) as usize;
    pos += 2 + cipher_suites_len;
    let compression_len = *buf.get(pos)? as usize;
    pos += 1 + compression_len;
    if pos + 2 > buf.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(buf.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let ext_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if ext_type == 0 {
            // server_name extension
            let list_start = pos + 2;
            if list_start + 3 > buf.len() {
                return None;
            }
            let name_len = u16::from_be_bytes([buf[list_start + 1], buf[list_start + 2]]) as usize;
            let name_start = list_start + 3;
            let name_end = name_start + name_len;
            if name_end > buf.len() {
                return None;
            }
            return Some(String::from_utf8_lossy(&buf[name_start..name_end]).to_string());
        }
        pos += ext_len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_path_from_http_request() {
        let req = b"GET /app/page?x=1 HTTP/1.1\r\nHost: foo.example.com\r\nUser-Agent: x\r\n\r\n";
        let (host, path) = parse_http_host_path(req).unwrap();
        assert_eq!(host, "foo.example.com");
        assert_eq!(path, "/app/page");
    }

    #[test]
    fn wildcard_host_drops_leftmost_label() {
        assert_eq!(wildcard_host("foo.example.com").as_deref(), Some("*.example.com"));
        assert_eq!(wildcard_host("example.com"), None);
    }

    #[test]
    fn rewrites_host_header_in_place() {
        let req = b"GET / HTTP/1.1\r\nHost: foo.example.com\r\n\r\n";
        let out = rewrite_host_header(req, "internal.local");
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Host: internal.local"));
        assert!(!out.contains("foo.example.com"));
    }

    #[test]
    fn basic_auth_accepts_matching_credentials() {
        let creds = base64::engine::general_purpose::STANDARD.encode(b"alice:secret");
        let req = format!(
            "GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic {creds}\r\n\r\n"
        );
        assert!(check_basic_auth(req.as_bytes(), "alice", "secret").is_ok());
        assert!(check_basic_auth(req.as_bytes(), "alice", "wrong").is_err());
    }

    #[tokio::test]
    async fn shared_conn_replays_prefix_before_socket_bytes() {
        let prefix = b"peeked".to_vec();
        let cursor = std::io::Cursor::new(b"live".to_vec());
        let mut shared = SharedConn::new(prefix, cursor);
        let mut out = Vec::new();
        shared.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"peekedlive");
    }
}
