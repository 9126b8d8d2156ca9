//! xtunneld/src/proxy.rs
//! The proxy set: TCP, UDP, HTTP, HTTPS and FTP proxies, each built on the
//! same "accept a user connection, borrow a work connection from the
//! client's pool, splice" shape, with per-type wiring for vhost routing
//! or FTP control-channel rewriting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::compress;
use crate::error::{Result, TunnelError};
use crate::message::{self, Message, UdpPacket};
use crate::stats::ServerStatistics;
use crate::vhost::SharedConn;

/// How many times `handle_user_connection` will pull a fresh work
/// connection from the pool before giving up on a single user connection,
/// a small cushion over the configured pool size.
pub const WORK_CONN_RETRY_MARGIN: usize = 1;

/// Handed to every proxy at construction time; abstracts over the control
/// session's pool of pre-established work connections so `proxy.rs` never
/// has to know about `control.rs`'s reader/writer/manager tasks.
#[derive(Clone)]
pub struct WorkConnPool {
    request_tx: mpsc::UnboundedSender<oneshot::Sender<TcpStream>>,
    pool_count: usize,
    user_conn_timeout: Duration,
}

impl WorkConnPool {
    pub fn new(
        request_tx: mpsc::UnboundedSender<oneshot::Sender<TcpStream>>,
        pool_count: usize,
        user_conn_timeout: Duration,
    ) -> Self {
        WorkConnPool {
            request_tx,
            pool_count,
            user_conn_timeout,
        }
    }

    /// Requests a work connection and waits up to `UserConnTimeout` for
    /// one to arrive (spec §4.E's `GetWorkConn`, §5, scenario S2).
    pub async fn get(&self) -> Result<TcpStream> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(tx)
            .map_err(|_| TunnelError::ControlClosed)?;
        match tokio::time::timeout(self.user_conn_timeout, rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) | Err(_) => Err(TunnelError::WorkConnTimeout),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.pool_count + WORK_CONN_RETRY_MARGIN
    }
}

#[derive(Clone, Default)]
pub struct EncodingInfo {
    pub use_encryption: bool,
    pub use_compression: bool,
    pub encryption_token: Option<Arc<Vec<u8>>>,
}

#[derive(Clone)]
pub struct BaseProxy {
    pub name: String,
    pub run_id: String,
    pub proxy_type: String,
    pub pool: WorkConnPool,
    pub stats: Arc<ServerStatistics>,
    pub encoding: EncodingInfo,
}

impl BaseProxy {
    /// Wraps a freshly-pulled work connection in the proxy's configured
    /// encryption and/or compression, encryption first (spec §6: "compression
    /// is applied after encryption").
    async fn wrap_work_conn(&self, work_conn: TcpStream) -> Result<crate::crypto::BoxedStream> {
        let token = self.encoding.encryption_token.as_deref().map(|v| v.as_slice());
        compress::wrap_work_conn(
            work_conn,
            self.encoding.use_encryption,
            token,
            self.encoding.use_compression,
        )
        .await
    }

    /// Accepts one user connection, requesting fresh work connections
    /// from the pool until one succeeds or the retry budget is spent.
    pub async fn handle_user_connection(&self, user_conn: TcpStream, peer: SocketAddr) {
        self.stats.open_connection(&self.name);
        let attempts = self.pool.max_attempts();
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.pool.get().await {
                Ok(work_conn) => {
                    match self.wrap_work_conn(work_conn).await {
                        Ok(wrapped) => {
                            if let Err(e) = splice(user_conn, wrapped, &self.name, &self.stats).await {
                                debug!(proxy = self.name.as_str(), error = %e, "splice ended with error");
                            }
                        }
                        Err(e) => warn!(proxy = self.name.as_str(), error = %e, "failed to wrap work connection"),
                    }
                    self.stats.close_connection(&self.name);
                    return;
                }
                Err(e) => {
                    warn!(
                        proxy = self.name.as_str(),
                        attempt, peer = %peer, error = %e, "work connection attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        error!(
            proxy = self.name.as_str(),
            peer = %peer,
            error = ?last_err,
            "exhausted work connection retries for user connection"
        );
        self.stats.close_connection(&self.name);
    }
}

/// Copies bytes in both directions between `a` and `b`, crediting traffic
/// stats to `name`.
pub async fn splice<A, B>(a: A, b: B, name: &str, stats: &Arc<ServerStatistics>) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let name_in = name.to_string();
    let stats_in = stats.clone();
    let inbound = tokio::spawn(async move {
        let n = tokio::io::copy(&mut ar, &mut bw).await.unwrap_or(0);
        stats_in.add_traffic_in(&name_in, n as i64);
    });

    let name_out = name.to_string();
    let stats_out = stats.clone();
    let outbound = tokio::spawn(async move {
        let n = tokio::io::copy(&mut br, &mut aw).await.unwrap_or(0);
        stats_out.add_traffic_out(&name_out, n as i64);
    });

    let _ = tokio::join!(inbound, outbound);
    Ok(())
}

/// Plain TCP and HTTP/HTTPS (post-vhost-routing) proxies share this loop.
pub struct TcpProxy {
    base: BaseProxy,
}

impl TcpProxy {
    pub fn new(base: BaseProxy) -> Self {
        TcpProxy { base }
    }

    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let base = self.base.clone();
                    tokio::spawn(async move {
                        base.handle_user_connection(conn, peer).await;
                    });
                }
                Err(e) => {
                    error!(proxy = self.base.name.as_str(), error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// For HTTP/HTTPS proxies, user connections arrive already routed by
    /// the vhost muxer rather than from a dedicated listener.
    pub async fn run_from_vhost(self, mut rx: mpsc::UnboundedReceiver<SharedConn<TcpStream>>) {
        while let Some(conn) = rx.recv().await {
            let base = self.base.clone();
            let peer: SocketAddr = "0.0.0.0:0".parse().unwrap();
            tokio::spawn(async move {
                base.handle_user_connection_shared(conn, peer).await;
            });
        }
    }
}

impl BaseProxy {
    async fn handle_user_connection_shared(&self, user_conn: SharedConn<TcpStream>, peer: SocketAddr) {
        self.stats.open_connection(&self.name);
        let attempts = self.pool.max_attempts();
        for attempt in 0..attempts {
            match self.pool.get().await {
                Ok(work_conn) => {
                    match self.wrap_work_conn(work_conn).await {
                        Ok(wrapped) => {
                            if let Err(e) = splice(user_conn, wrapped, &self.name, &self.stats).await {
                                debug!(proxy = self.name.as_str(), error = %e, "splice ended with error");
                            }
                        }
                        Err(e) => warn!(proxy = self.name.as_str(), error = %e, "failed to wrap work connection"),
                    }
                    self.stats.close_connection(&self.name);
                    return;
                }
                Err(e) => {
                    warn!(proxy = self.name.as_str(), attempt, peer = %peer, error = %e, "work connection attempt failed");
                }
            }
        }
        self.stats.close_connection(&self.name);
    }
}

/// FTP control-channel proxy: splices like a plain TCP proxy, except the
/// work-conn-to-user direction is scanned for PASV/EPSV-style responses
/// so the public-facing port survives the reverse tunnel hop. Resolved to
/// run server-side (see design notes on the client/server split).
pub struct FtpProxy {
    base: BaseProxy,
    public_ip: [u8; 4],
    data_port: u16,
}

impl FtpProxy {
    pub fn new(base: BaseProxy, public_ip: [u8; 4], data_port: u16) -> Self {
        FtpProxy {
            base,
            public_ip,
            data_port,
        }
    }

    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let base = self.base.clone();
                    let public_ip = self.public_ip;
                    let data_port = self.data_port;
                    tokio::spawn(async move {
                        Self::handle(base, conn, peer, public_ip, data_port).await;
                    });
                }
                Err(e) => {
                    error!(proxy = self.base.name.as_str(), error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    async fn handle(base: BaseProxy, user_conn: TcpStream, peer: SocketAddr, public_ip: [u8; 4], data_port: u16) {
        base.stats.open_connection(&base.name);
        let attempts = base.pool.max_attempts();
        for attempt in 0..attempts {
            match base.pool.get().await {
                Ok(work_conn) => {
                    match base.wrap_work_conn(work_conn).await {
                        Ok(wrapped) => {
                            if let Err(e) = splice_ftp_control(
                                user_conn,
                                wrapped,
                                &base.name,
                                &base.stats,
                                public_ip,
                                data_port,
                            )
                            .await
                            {
                                debug!(proxy = base.name.as_str(), error = %e, "ftp splice ended with error");
                            }
                        }
                        Err(e) => warn!(proxy = base.name.as_str(), error = %e, "failed to wrap work connection"),
                    }
                    base.stats.close_connection(&base.name);
                    return;
                }
                Err(e) => {
                    warn!(proxy = base.name.as_str(), attempt, peer = %peer, error = %e, "work connection attempt failed");
                }
            }
        }
        base.stats.close_connection(&base.name);
    }
}

async fn splice_ftp_control(
    user_conn: TcpStream,
    work_conn: crate::crypto::BoxedStream,
    name: &str,
    stats: &Arc<ServerStatistics>,
    public_ip: [u8; 4],
    data_port: u16,
) -> Result<()> {
    let (mut ur, mut uw) = tokio::io::split(user_conn);
    let (mut wr, mut ww) = tokio::io::split(work_conn);

    let name_in = name.to_string();
    let stats_in = stats.clone();
    let inbound = tokio::spawn(async move {
        let n = tokio::io::copy(&mut ur, &mut ww).await.unwrap_or(0);
        stats_in.add_traffic_in(&name_in, n as i64);
    });

    let name_out = name.to_string();
    let stats_out = stats.clone();
    let outbound = tokio::spawn(async move {
        let n = copy_rewriting_pasv(&mut wr, &mut uw, public_ip, data_port)
            .await
            .unwrap_or(0);
        stats_out.add_traffic_out(&name_out, n as i64);
    });

    let _ = tokio::join!(inbound, outbound);
    Ok(())
}

/// Copies the work-conn-to-user direction of an FTP control channel,
/// rewriting any `227 ...(h1,h2,h3,h4,p1,p2)` response to point at the
/// server's public IP and the fixed public data port, and passing `211`
/// continuation lines through untouched.
///
/// The spec's "211 response shorter than 87 bytes needs an extra
/// continuation read before forwarding" is this loop's general case, not
/// a special one: it never forwards a partial line. Every `read()` only
/// appends to `pending`; a line is written out exactly when a `\r\n` is
/// found in it, however many reads that took. A short first `211` frame
/// (or any response split across reads for any other reason) just means
/// the `while` below finds no `\r\n` yet and the `loop` goes around for
/// another `read()` -- the same continuation the spec describes.
async fn copy_rewriting_pasv<R, W>(reader: &mut R, writer: &mut W, public_ip: [u8; 4], data_port: u16) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; 4096];
    let mut pending = Vec::new();

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        pending.extend_from_slice(&buf[..n]);

        while let Some(idx) = pending.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = pending.drain(..idx + 2).collect();
            let out_line = rewrite_pasv_line(&line, public_ip, data_port);
            writer.write_all(&out_line).await?;
        }
    }
    if !pending.is_empty() {
        let out_line = rewrite_pasv_line(&pending, public_ip, data_port);
        writer.write_all(&out_line).await?;
    }
    writer.flush().await?;
    Ok(total)
}

fn rewrite_pasv_line(line: &[u8], public_ip: [u8; 4], data_port: u16) -> Vec<u8> {
    let text = String::from_utf8_lossy(line);
    if text.starts_with("227") {
        new_ftp_pasv(&text, public_ip, data_port).into_bytes()
    } else {
        line.to_vec()
    }
}

/// Builds a rewritten PASV response from an original `227 ...` line,
/// replacing only the encoded `(h1,h2,h3,h4,p1,p2)` tuple.
pub fn new_ftp_pasv(original: &str, ip: [u8; 4], port: u16) -> String {
    let p1 = port / 256;
    let p2 = port % 256;
    let trimmed = original.trim_end_matches(['\r', '\n']);
    let suffix: String = original.chars().rev().take_while(|c| *c == '\r' || *c == '\n').collect();
    let suffix: String = suffix.chars().rev().collect();

    let prefix = match trimmed.find('(') {
        Some(i) => &trimmed[..i],
        None => trimmed,
    };
    format!(
        "{prefix}({},{},{},{},{},{}){suffix}",
        ip[0], ip[1], ip[2], ip[3], p1, p2
    )
}

/// Extracts the port encoded in a `227 ...(h1,h2,h3,h4,p1,p2)` response,
/// the inverse of [`new_ftp_pasv`]'s encoding.
pub fn get_ftp_pasv_port(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = start + text[start..].find(')')?;
    let nums: Vec<&str> = text[start + 1..end].split(',').collect();
    if nums.len() != 6 {
        return None;
    }
    let p1: u32 = nums[4].trim().parse().ok()?;
    let p2: u32 = nums[5].trim().parse().ok()?;
    Some(((p1 * 256) + p2) as u16)
}

/// Read deadline on a UDP work connection: the client must keep sending
/// something (a `UdpPacket` or an in-band `Ping`) at least this often or
/// the supervisor treats the connection as dead and replaces it.
const UDP_WORK_CONN_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
const UDP_SUPERVISOR_INITIAL_GRACE: std::time::Duration = std::time::Duration::from_millis(500);
const UDP_SUPERVISOR_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// A UDP proxy holds exactly one work connection at a time: a supervisor
/// fiber keeps fetching a replacement from the pool whenever the current
/// one dies, while a separate forwarder demultiplexes datagrams on the
/// public socket by source address into framed `UdpPacket` messages over
/// whichever work connection is currently live.
pub struct UdpProxy {
    base: BaseProxy,
}

type PublicDatagram = (SocketAddr, Vec<u8>);
type WorkConnPacket = (String, Vec<u8>);

impl UdpProxy {
    pub fn new(base: BaseProxy) -> Self {
        UdpProxy { base }
    }

    pub async fn run(self, socket: UdpSocket) {
        let socket = Arc::new(socket);

        // to_work: datagrams read off the public socket, destined for
        // whichever work conn is currently active.
        let (to_work_tx, to_work_rx) = mpsc::unbounded_channel::<PublicDatagram>();
        // from_work: packets decoded off the active work conn, destined
        // for the public socket.
        let (from_work_tx, from_work_rx) = mpsc::unbounded_channel::<WorkConnPacket>();

        let recv_socket = socket.clone();
        let name = self.base.name.clone();
        let public_reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((n, peer)) => {
                        if to_work_tx.send((peer, buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(proxy = name.as_str(), error = %e, "udp recv failed");
                        break;
                    }
                }
            }
        });

        let send_socket = socket.clone();
        let public_writer = tokio::spawn(async move {
            Self::drain_to_public_socket(send_socket, from_work_rx).await;
        });

        Self::supervise(self.base, to_work_rx, from_work_tx).await;

        public_reader.abort();
        public_writer.abort();
    }

    async fn drain_to_public_socket(
        socket: Arc<UdpSocket>,
        mut from_work_rx: mpsc::UnboundedReceiver<WorkConnPacket>,
    ) {
        while let Some((remote_addr, content)) = from_work_rx.recv().await {
            if let Ok(peer) = remote_addr.parse::<SocketAddr>() {
                let _ = socket.send_to(&content, peer).await;
            }
        }
    }

    /// Maintains exactly one live work connection: on failure, waits a
    /// short grace period and asks the session's pool for another. Exits
    /// once `to_work_rx` closes (the proxy is shutting down).
    async fn supervise(
        base: BaseProxy,
        mut to_work_rx: mpsc::UnboundedReceiver<PublicDatagram>,
        from_work_tx: mpsc::UnboundedSender<WorkConnPacket>,
    ) {
        let mut first_attempt = true;
        loop {
            if first_attempt {
                tokio::time::sleep(UDP_SUPERVISOR_INITIAL_GRACE).await;
            }
            let work_conn = match base.pool.get().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(proxy = base.name.as_str(), error = %e, "no work conn available for udp proxy, retrying");
                    first_attempt = false;
                    tokio::time::sleep(UDP_SUPERVISOR_RETRY_DELAY).await;
                    continue;
                }
            };
            first_attempt = false;
            base.stats.open_connection(&base.name);
            let keep_running = Self::run_with_work_conn(&base, work_conn, &mut to_work_rx, &from_work_tx).await;
            base.stats.close_connection(&base.name);
            if !keep_running {
                return;
            }
            tokio::time::sleep(UDP_SUPERVISOR_RETRY_DELAY).await;
        }
    }

    /// Runs one work connection's reader and writer fibers until either
    /// dies or the public-socket channel closes. Returns `true` when the
    /// connection died and a replacement should be fetched, `false` when
    /// the proxy itself is shutting down (the public socket's reader is
    /// gone, so there's nothing left to forward).
    async fn run_with_work_conn(
        base: &BaseProxy,
        work_conn: TcpStream,
        to_work_rx: &mut mpsc::UnboundedReceiver<PublicDatagram>,
        from_work_tx: &mpsc::UnboundedSender<WorkConnPacket>,
    ) -> bool {
        let (mut reader, mut writer) = tokio::io::split(work_conn);
        let (dead_tx, mut dead_rx) = oneshot::channel::<()>();

        let name = base.name.clone();
        let stats = base.stats.clone();
        let from_work_tx = from_work_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let outcome = tokio::time::timeout(UDP_WORK_CONN_IDLE_TIMEOUT, message::read_msg(&mut reader)).await;
                match outcome {
                    Ok(Ok(Message::UdpPacket(pkt))) => {
                        stats.add_traffic_out(&name, pkt.content.len() as i64);
                        if from_work_tx.send((pkt.remote_addr.clone(), pkt.content)).is_err() {
                            break;
                        }
                    }
                    Ok(Ok(Message::Ping(_))) => continue,
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            let _ = dead_tx.send(());
        });

        let keep_running = loop {
            tokio::select! {
                datagram = to_work_rx.recv() => {
                    match datagram {
                        Some((peer, content)) => {
                            let msg = Message::UdpPacket(UdpPacket {
                                local_addr: String::new(),
                                remote_addr: peer.to_string(),
                                content: content.clone(),
                            });
                            if message::write_msg(&mut writer, &msg).await.is_err() {
                                break true;
                            }
                            base.stats.add_traffic_in(&base.name, content.len() as i64);
                        }
                        None => break false,
                    }
                }
                _ = &mut dead_rx => {
                    break true;
                }
            }
        };
        reader_task.abort();
        keep_running
    }
}

pub struct ProxyRegistry {
    names: DashMap<String, String>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        ProxyRegistry {
            names: DashMap::new(),
        }
    }

    pub fn register(&self, name: &str, proxy_type: &str) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(TunnelError::AlreadyRegistered(name.to_string()));
        }
        self.names.insert(name.to_string(), proxy_type.to_string());
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.names.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn ftp_data_proxy_name(name: &str) -> String {
        format!("{name}_ftp_data_proxy")
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ftp_pasv_round_trips_through_rewrite() {
        let original = "227 Entering Passive Mode (10,0,0,1,200,13)\r\n";
        let rewritten = new_ftp_pasv(original, [203, 0, 113, 5], 51413);
        let port = get_ftp_pasv_port(&rewritten).unwrap();
        assert_eq!(port, 51413);
        assert!(rewritten.contains("203,0,113,5"));
        assert!(rewritten.ends_with("\r\n"));
    }

    #[test]
    fn non_pasv_lines_pass_through_untouched() {
        let line = b"211-Extensions supported\r\n".to_vec();
        let out = rewrite_pasv_line(&line, [1, 2, 3, 4], 100);
        assert_eq!(out, line);
    }

    /// Hands out one fixed chunk per `poll_read` call, forcing a reader
    /// to issue multiple reads to see bytes that arrive "together" in a
    /// single logical response -- simulating a short first `211` frame
    /// that needs a continuation read.
    struct ChunkedReader {
        chunks: std::collections::VecDeque<Vec<u8>>,
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if let Some(chunk) = self.chunks.pop_front() {
                buf.put_slice(&chunk);
            }
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn copy_rewriting_pasv_forwards_a_211_response_split_across_reads() {
        // First frame is under 87 bytes and doesn't contain a full line;
        // the rest of the "211-...\r\n211 End\r\n" response trails in a
        // second read.
        let first = b"211-".to_vec();
        assert!(first.len() < 87);
        let second = b"FTP server status:\r\n211 End of status\r\n".to_vec();

        let mut reader = ChunkedReader {
            chunks: vec![first, second].into(),
        };
        let mut out = Vec::new();

        let n = copy_rewriting_pasv(&mut reader, &mut out, [1, 2, 3, 4], 100)
            .await
            .unwrap();

        assert_eq!(out, b"211-FTP server status:\r\n211 End of status\r\n");
        assert_eq!(n, out.len() as u64);
    }

    #[test]
    fn ftp_data_proxy_name_matches_convention() {
        assert_eq!(ProxyRegistry::ftp_data_proxy_name("myftp"), "myftp_ftp_data_proxy");
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let reg = ProxyRegistry::new();
        reg.register("p", "tcp").unwrap();
        assert!(matches!(reg.register("p", "tcp"), Err(TunnelError::AlreadyRegistered(_))));
    }

    /// Spawns a task that answers every `WorkConnPool::get()` request with
    /// a fresh loopback TCP pair, keeping the "client" end so the test can
    /// speak the framed protocol on it directly.
    fn spawn_work_conn_supplier() -> (WorkConnPool, mpsc::UnboundedReceiver<TcpStream>) {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<oneshot::Sender<TcpStream>>();
        let (client_tx, client_rx) = mpsc::unbounded_channel::<TcpStream>();
        tokio::spawn(async move {
            while let Some(reply) = request_rx.recv().await {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let connect = TcpStream::connect(addr);
                let (accepted, connected) = tokio::join!(listener.accept(), connect);
                let _ = reply.send(accepted.unwrap().0);
                let _ = client_tx.send(connected.unwrap());
            }
        });
        (
            WorkConnPool::new(request_tx, 1, Duration::from_secs(5)),
            client_rx,
        )
    }

    #[tokio::test]
    async fn udp_proxy_round_trips_a_datagram_over_the_work_conn() {
        let (pool, mut client_rx) = spawn_work_conn_supplier();
        let base = BaseProxy {
            name: "u".to_string(),
            run_id: "X".to_string(),
            proxy_type: "udp".to_string(),
            pool,
            stats: Arc::new(ServerStatistics::new(true)),
            encoding: EncodingInfo::default(),
        };

        let public_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let public_addr = public_socket.local_addr().unwrap();

        tokio::spawn(async move { UdpProxy::new(base).run(public_socket).await });

        let user_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        user_socket.connect(public_addr).await.unwrap();
        user_socket.send(b"hello").await.unwrap();

        let mut client_conn = tokio::time::timeout(Duration::from_secs(5), client_rx.recv())
            .await
            .expect("supplier didn't time out")
            .expect("work conn supplied");

        let decoded = message::read_msg(&mut client_conn).await.unwrap();
        let pkt = match decoded {
            Message::UdpPacket(p) => p,
            other => panic!("expected UdpPacket, got {other:?}"),
        };
        assert_eq!(pkt.content, b"hello");
        let user_addr = pkt.remote_addr.clone();

        let reply = Message::UdpPacket(UdpPacket {
            local_addr: String::new(),
            remote_addr: user_addr,
            content: b"world".to_vec(),
        });
        message::write_msg(&mut client_conn, &reply).await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), user_socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"world");
    }
}
