//! xtunneld/src/control.rs
//! The control session state machine: one per logged-in client, running
//! four cooperating tasks (reader / writer / manager / stopper) over the
//! single persistent control connection, plus a pool of work connections
//! the client opens on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};
use crate::message::{self, LoginResp, Message, NewProxy, NewProxyResp, Ping, Pong, ReqWorkConn};
use crate::proxy::WorkConnPool;

/// What a registered proxy needs torn down when its owning session ends:
/// either a dedicated listener's accept-loop task (Tcp/Udp/Ftp), or the
/// set of vhost routes plus the `run_from_vhost` dispatch task (Http/Https).
pub enum ProxyHandle {
    Listener(AbortHandle),
    Vhost {
        is_tls: bool,
        routes: Vec<(String, String)>,
        abort: AbortHandle,
    },
}

/// One proxy registered by this session, recorded so the stopper can
/// unregister it from `Service.proxies`/the vhost muxer and close its
/// listener task on session end (spec §4.E, §8 invariant 2).
pub struct ProxyRecord {
    pub name: String,
    pub proxy_type: String,
    pub handle: ProxyHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    New,
    Working,
    Draining,
    Closed,
}

/// A `NewProxy` request from the client, paired with a reply channel; the
/// control session forwards these to whoever owns proxy registration
/// (the service root) rather than handling registration itself.
pub struct NewProxyRequest {
    pub run_id: String,
    pub req: NewProxy,
    pub reply: oneshot::Sender<NewProxyResp>,
}

struct Shared {
    state: std::sync::Mutex<ControlState>,
    last_ping: std::sync::Mutex<Instant>,
    draining: AtomicBool,
}

/// Handle to a running control session. Cloning shares the same
/// underlying tasks; dropping all handles does not stop the session --
/// call `close()` explicitly or let the heartbeat watchdog do it.
#[derive(Clone)]
pub struct Control {
    pub run_id: String,
    pub pool_count: usize,
    user_conn_timeout: Duration,
    outbound_tx: mpsc::UnboundedSender<Message>,
    work_conn_tx: mpsc::UnboundedSender<TcpStream>,
    request_tx: mpsc::UnboundedSender<oneshot::Sender<TcpStream>>,
    close_tx: mpsc::UnboundedSender<()>,
    shared: Arc<Shared>,
    proxies: Arc<std::sync::Mutex<Vec<ProxyRecord>>>,
}

impl Control {
    pub fn work_conn_pool(&self) -> WorkConnPool {
        WorkConnPool::new(self.request_tx.clone(), self.pool_count, self.user_conn_timeout)
    }

    /// Identity check used on teardown: true when `other` is the very
    /// session this handle refers to, not merely one sharing its `run_id`
    /// (a replacement login swaps in a new session under the same id).
    pub fn same_session(&self, other: &Control) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Tracks a proxy this session registered, so it can be torn down
    /// when the session ends.
    pub fn record_proxy(&self, record: ProxyRecord) {
        self.proxies.lock().unwrap().push(record);
    }

    /// Drains the list of proxies this session registered. Called once,
    /// on session teardown.
    pub fn take_proxies(&self) -> Vec<ProxyRecord> {
        std::mem::take(&mut *self.proxies.lock().unwrap())
    }

    pub fn register_work_conn(&self, conn: TcpStream) -> Result<()> {
        self.work_conn_tx
            .send(conn)
            .map_err(|_| TunnelError::ControlClosed)
    }

    pub fn record_ping(&self) {
        *self.shared.last_ping.lock().unwrap() = Instant::now();
    }

    pub fn state(&self) -> ControlState {
        *self.shared.state.lock().unwrap()
    }

    pub fn begin_draining(&self) {
        self.shared.draining.store(true, Ordering::SeqCst);
        *self.shared.state.lock().unwrap() = ControlState::Draining;
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(());
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        self.outbound_tx
            .send(msg)
            .map_err(|_| TunnelError::ControlClosed)
    }
}

/// Spawns the four tasks backing one control session and returns the
/// handle plus a receiver of `NewProxy` requests the caller must service
/// (replying on the bundled oneshot) and a one-shot future that resolves
/// when the session has fully stopped. When `encryption_token` is set, the
/// whole control channel is wrapped in [`crate::crypto::EncryptedStream`]
/// before the reader/writer tasks ever touch it, mirroring the original's
/// server-config-wide (not per-login) `UseEncryption` gate on the control
/// connection's reader/writer.
pub async fn spawn<S>(
    conn: S,
    run_id: String,
    pool_count: usize,
    heartbeat_timeout: Duration,
    user_conn_timeout: Duration,
    login_version: String,
    encryption_token: Option<Vec<u8>>,
) -> Result<(Control, mpsc::UnboundedReceiver<NewProxyRequest>, oneshot::Receiver<()>)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stream: crate::crypto::BoxedStream = match encryption_token {
        Some(token) => crate::crypto::negotiate(Box::new(conn), &token).await?,
        None => Box::new(conn),
    };
    let (read_half, write_half) = tokio::io::split(stream);

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (work_conn_tx, work_conn_rx) = mpsc::unbounded_channel::<TcpStream>();
    let (request_tx, request_rx) = mpsc::unbounded_channel::<oneshot::Sender<TcpStream>>();
    let (close_tx, close_rx) = mpsc::unbounded_channel::<()>();
    let (new_proxy_tx, new_proxy_rx) = mpsc::unbounded_channel::<NewProxyRequest>();
    let (stopped_tx, stopped_rx) = oneshot::channel::<()>();

    let shared = Arc::new(Shared {
        state: std::sync::Mutex::new(ControlState::New),
        last_ping: std::sync::Mutex::new(Instant::now()),
        draining: AtomicBool::new(false),
    });

    let control = Control {
        run_id: run_id.clone(),
        pool_count,
        user_conn_timeout,
        outbound_tx: outbound_tx.clone(),
        work_conn_tx,
        request_tx,
        close_tx: close_tx.clone(),
        shared: shared.clone(),
        proxies: Arc::new(std::sync::Mutex::new(Vec::new())),
    };

    *shared.state.lock().unwrap() = ControlState::Working;

    let _ = outbound_tx.send(Message::LoginResp(LoginResp {
        version: login_version,
        run_id: run_id.clone(),
        error: String::new(),
    }));

    let writer_handle = spawn_writer(write_half, outbound_rx);
    let reader_handle = spawn_reader(read_half, run_id.clone(), outbound_tx.clone(), new_proxy_tx, shared.clone());
    let manager_handle = spawn_manager(work_conn_rx, request_rx, outbound_tx.clone(), pool_count);
    spawn_stopper(
        shared.clone(),
        close_rx,
        heartbeat_timeout,
        stopped_tx,
        reader_handle,
        writer_handle,
        manager_handle,
    );

    Ok((control, new_proxy_rx, stopped_rx))
}

fn spawn_writer<W>(mut write_half: W, mut outbound_rx: mpsc::UnboundedReceiver<Message>) -> AbortHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let handle = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = message::write_msg(&mut write_half, &msg).await {
                warn!(error = %e, "control writer failed, stopping");
                break;
            }
        }
        debug!("control writer task exiting");
    });
    handle.abort_handle()
}

fn spawn_reader<R>(
    mut read_half: R,
    run_id: String,
    outbound_tx: mpsc::UnboundedSender<Message>,
    new_proxy_tx: mpsc::UnboundedSender<NewProxyRequest>,
    shared: Arc<Shared>,
) -> AbortHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let handle = tokio::spawn(async move {
        loop {
            match message::read_msg(&mut read_half).await {
                Ok(Message::Ping(Ping {})) => {
                    *shared.last_ping.lock().unwrap() = Instant::now();
                    if outbound_tx.send(Message::Pong(Pong {})).is_err() {
                        break;
                    }
                }
                Ok(Message::NewProxy(req)) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if new_proxy_tx
                        .send(NewProxyRequest {
                            run_id: run_id.clone(),
                            req,
                            reply: reply_tx,
                        })
                        .is_err()
                    {
                        break;
                    }
                    let outbound_tx = outbound_tx.clone();
                    tokio::spawn(async move {
                        if let Ok(resp) = reply_rx.await {
                            let _ = outbound_tx.send(Message::NewProxyResp(resp));
                        }
                    });
                }
                Ok(other) => {
                    debug!(run_id = run_id.as_str(), msg = ?other, "ignoring unexpected message on control channel");
                }
                Err(e) => {
                    info!(run_id = run_id.as_str(), error = %e, "control reader stopping");
                    break;
                }
            }
        }
    });
    handle.abort_handle()
}

/// Work-conn pool bound: caps the pool at `PoolCount + QUEUE_SLACK` so a
/// client that floods `NewWorkConn` can't grow the server's per-session
/// memory without bound.
const QUEUE_SLACK: usize = 10;

fn spawn_manager(
    mut work_conn_rx: mpsc::UnboundedReceiver<TcpStream>,
    mut request_rx: mpsc::UnboundedReceiver<oneshot::Sender<TcpStream>>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    pool_count: usize,
) -> AbortHandle {
    let max_pool = pool_count + QUEUE_SLACK;
    let handle = tokio::spawn(async move {
        let pool = Mutex::new(VecDeque::<TcpStream>::new());
        let waiters = Mutex::new(VecDeque::<oneshot::Sender<TcpStream>>::new());

        loop {
            tokio::select! {
                conn = work_conn_rx.recv() => {
                    match conn {
                        Some(conn) => {
                            let mut waiters_guard = waiters.lock().await;
                            if let Some(waiter) = waiters_guard.pop_front() {
                                let _ = waiter.send(conn);
                            } else {
                                let mut pool_guard = pool.lock().await;
                                if pool_guard.len() >= max_pool {
                                    debug!("work-conn pool full, closing overflow connection");
                                    drop(conn);
                                } else {
                                    pool_guard.push_back(conn);
                                }
                            }
                        }
                        None => break,
                    }
                }
                req = request_rx.recv() => {
                    match req {
                        Some(reply) => {
                            let popped = pool.lock().await.pop_front();
                            match popped {
                                Some(conn) => { let _ = reply.send(conn); }
                                None => {
                                    waiters.lock().await.push_back(reply);
                                    if outbound_tx.send(Message::ReqWorkConn(ReqWorkConn {})).is_err() {
                                        break;
                                    }
                                }
                            }
                            let low_water = pool.lock().await.len() < pool_count;
                            if low_water {
                                let _ = outbound_tx.send(Message::ReqWorkConn(ReqWorkConn {}));
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        debug!("control manager task exiting");
    });
    handle.abort_handle()
}

/// Drives the shutdown trigger (heartbeat timeout or an explicit
/// `close()`) and then tears the session down: the reader is aborted
/// first (no more messages are dispatched), then the manager (dropping
/// its pooled and waiting work connections, closing each), then the
/// writer -- which, together with the reader, owns the only handles to
/// the split control stream, so aborting both actually closes the
/// socket instead of leaving it parked forever (spec §4.E's stopper,
/// invariant 5).
fn spawn_stopper(
    shared: Arc<Shared>,
    mut close_rx: mpsc::UnboundedReceiver<()>,
    heartbeat_timeout: Duration,
    stopped_tx: oneshot::Sender<()>,
    reader: AbortHandle,
    writer: AbortHandle,
    manager: AbortHandle,
) {
    tokio::spawn(async move {
        loop {
            let since_last = {
                let last = *shared.last_ping.lock().unwrap();
                last.elapsed()
            };
            let remaining = heartbeat_timeout.saturating_sub(since_last);

            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    let since_last = shared.last_ping.lock().unwrap().elapsed();
                    if since_last >= heartbeat_timeout {
                        warn!("control session heartbeat timed out");
                        break;
                    }
                }
                closed = close_rx.recv() => {
                    if closed.is_some() {
                        info!("control session closed by request");
                    }
                    break;
                }
            }
        }

        reader.abort();
        manager.abort();
        writer.abort();

        *shared.state.lock().unwrap() = ControlState::Closed;
        let _ = stopped_tx.send(());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn spawn_sends_login_resp_immediately() {
        let (client, server) = duplex(4096);
        let (_control, _new_proxy_rx, _stopped) = spawn(
            server,
            "run-1".to_string(),
            2,
            Duration::from_secs(5),
            Duration::from_secs(5),
            "0.1".to_string(),
            None,
        )
        .await
        .unwrap();

        let mut client = client;
        let msg = message::read_msg(&mut client).await.unwrap();
        match msg {
            Message::LoginResp(r) => assert_eq!(r.run_id, "run-1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_updates_last_ping_and_replies_with_pong() {
        let (mut client, server) = duplex(4096);
        let (control, _new_proxy_rx, _stopped) = spawn(
            server,
            "run-2".to_string(),
            2,
            Duration::from_secs(5),
            Duration::from_secs(5),
            "0.1".to_string(),
            None,
        )
        .await
        .unwrap();

        // drain LoginResp
        let _ = message::read_msg(&mut client).await.unwrap();

        message::write_msg(&mut client, &Message::Ping(Ping {})).await.unwrap();
        let resp = message::read_msg(&mut client).await.unwrap();
        assert!(matches!(resp, Message::Pong(_)));
        assert!(control.shared.last_ping.lock().unwrap().elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn request_without_pool_triggers_req_work_conn() {
        let (mut client, server) = duplex(4096);
        let (control, _new_proxy_rx, _stopped) = spawn(
            server,
            "run-3".to_string(),
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            "0.1".to_string(),
            None,
        )
        .await
        .unwrap();
        let _ = message::read_msg(&mut client).await.unwrap(); // LoginResp

        let pool = control.work_conn_pool();
        let pool_task = tokio::spawn(async move { pool.get().await });

        let req = message::read_msg(&mut client).await.unwrap();
        assert!(matches!(req, Message::ReqWorkConn(_)));

        let (a, _b) = tokio::io::duplex(16);
        // Can't construct a real TcpStream in-test; exercise cancellation path instead.
        pool_task.abort();
        let _ = a;
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn work_conn_pool_is_capped_at_pool_count_plus_slack() {
        let (mut client, server) = duplex(4096);
        let (control, _new_proxy_rx, _stopped) = spawn(
            server,
            "run-4".to_string(),
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            "0.1".to_string(),
            None,
        )
        .await
        .unwrap();
        let _ = message::read_msg(&mut client).await.unwrap(); // LoginResp

        let max_pool = 1 + QUEUE_SLACK;
        for _ in 0..(max_pool + 3) {
            let (server_side, _client_side) = loopback_pair().await;
            control.register_work_conn(server_side).unwrap();
        }
        // give the manager task a moment to drain the channel
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pool = control.work_conn_pool();
        for _ in 0..max_pool {
            tokio::time::timeout(Duration::from_millis(200), pool.get())
                .await
                .expect("queued connection should be available immediately")
                .unwrap();
        }
        // overflow connections were dropped, so the pool is now empty and
        // this request has nothing to dequeue -- it blocks.
        assert!(tokio::time::timeout(Duration::from_millis(200), pool.get())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn spawn_with_encryption_negotiates_and_speaks_the_protocol() {
        let (client, server) = duplex(4096);
        let token = b"shared-secret".to_vec();

        let client_task = tokio::spawn({
            let token = token.clone();
            async move {
                let mut stream = crate::crypto::negotiate(Box::new(client), &token)
                    .await
                    .unwrap();
                let login_resp = message::read_msg(&mut stream).await.unwrap();
                message::write_msg(&mut stream, &Message::Ping(Ping {})).await.unwrap();
                let pong = message::read_msg(&mut stream).await.unwrap();
                (login_resp, pong)
            }
        });

        let (_control, _new_proxy_rx, _stopped) = spawn(
            server,
            "run-5".to_string(),
            1,
            Duration::from_secs(5),
            Duration::from_secs(5),
            "0.1".to_string(),
            Some(token),
        )
        .await
        .unwrap();

        let (login_resp, pong) = client_task.await.unwrap();
        assert!(matches!(login_resp, Message::LoginResp(_)));
        assert!(matches!(pong, Message::Pong(_)));
    }
}
