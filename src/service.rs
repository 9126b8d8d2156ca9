//! xtunneld/src/service.rs
//! The service root: owns the shared listeners, the port manager, the
//! statistics engine, the vhost muxers, and the registry of live control
//! sessions. Wires everything created in the other modules into a running
//! server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::control::{self, Control, NewProxyRequest, ProxyHandle, ProxyRecord};
use crate::error::{Result, TunnelError};
use crate::message::{self, Login, Message, NewProxy, NewProxyResp, ProxyType};
use crate::port::PortManager;
use crate::proxy::{BaseProxy, EncodingInfo, FtpProxy, ProxyRegistry, TcpProxy, UdpProxy};
use crate::stats::ServerStatistics;
use crate::vhost::{VhostMuxer, VhostRoute};

pub struct Service {
    config: ServerConfig,
    pub stats: Arc<ServerStatistics>,
    pub ports: Arc<PortManager>,
    vhost_http: Arc<VhostMuxer>,
    vhost_https: Arc<VhostMuxer>,
    controls: DashMap<String, Control>,
    proxies: Arc<ProxyRegistry>,
    reserved_ports: DashMap<u16, String>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let dashboard_enabled = config.dashboard_port != 0;
        Arc::new(Service {
            ports: Arc::new(PortManager::new(config.privileged_port_low, config.privileged_port_high)),
            stats: Arc::new(ServerStatistics::new(dashboard_enabled)),
            vhost_http: Arc::new(VhostMuxer::new()),
            vhost_https: Arc::new(VhostMuxer::new()),
            controls: DashMap::new(),
            proxies: Arc::new(ProxyRegistry::new()),
            reserved_ports: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        crate::stats::spawn_reaper(self.stats.clone());

        let main_addr: SocketAddr = format!("{}:{}", self.config.bind_addr, self.config.bind_port)
            .parse()
            .map_err(|e| TunnelError::Config(format!("invalid bind address: {e}")))?;
        let main_listener = TcpListener::bind(main_addr).await?;
        info!(addr = %main_addr, "listening for control and work connections");

        if self.config.vhost_http_port != 0 {
            let addr: SocketAddr = format!("{}:{}", self.config.bind_addr, self.config.vhost_http_port)
                .parse()
                .map_err(|e| TunnelError::Config(format!("invalid vhost http address: {e}")))?;
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %addr, "listening for vhost http");
            let this = self.clone();
            tokio::spawn(async move { this.run_vhost_listener(listener, false).await });
        }

        if self.config.vhost_https_port != 0 {
            let addr: SocketAddr = format!("{}:{}", self.config.bind_addr, self.config.vhost_https_port)
                .parse()
                .map_err(|e| TunnelError::Config(format!("invalid vhost https address: {e}")))?;
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %addr, "listening for vhost https");
            let this = self.clone();
            tokio::spawn(async move { this.run_vhost_listener(listener, true).await });
        }

        loop {
            let (conn, peer) = main_listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_incoming(conn, peer).await {
                    warn!(peer = %peer, error = %e, "incoming connection handling failed");
                }
            });
        }
    }

    async fn run_vhost_listener(self: Arc<Self>, listener: TcpListener, is_tls: bool) {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let muxer = if is_tls { &this.vhost_https } else { &this.vhost_http };
                        if let Err(e) = muxer
                            .handle(conn, is_tls, Duration::from_secs(this.config.user_conn_timeout))
                            .await
                        {
                            debug_or_warn(peer, &e);
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "vhost listener accept failed");
                    break;
                }
            }
        }
    }

    /// The first frame on every connection to the main port decides its
    /// role: `Login` starts a control session, `NewWorkConn` hands the raw
    /// socket to an existing session's work-conn pool.
    async fn handle_incoming(self: Arc<Self>, mut conn: TcpStream, peer: SocketAddr) -> Result<()> {
        let first = tokio::time::timeout(
            Duration::from_secs(self.config.user_conn_timeout),
            message::read_msg(&mut conn),
        )
        .await
        .map_err(|_| TunnelError::PeekTimeout)??;

        match first {
            Message::Login(login) => self.handle_login(conn, peer, login).await,
            Message::NewWorkConn(nwc) => {
                match self.controls.get(&nwc.run_id) {
                    Some(control) => control.register_work_conn(conn),
                    None => Err(TunnelError::ProtocolViolation(format!(
                        "work conn for unknown run_id {}",
                        nwc.run_id
                    ))),
                }
            }
            other => Err(TunnelError::ProtocolViolation(format!(
                "unexpected first frame on main port: {other:?}"
            ))),
        }
    }

    async fn handle_login(self: Arc<Self>, conn: TcpStream, peer: SocketAddr, login: Login) -> Result<()> {
        let existing = self.controls.get(&login.run_id).map(|c| c.clone());
        if let Some(existing) = existing {
            info!(run_id = login.run_id.as_str(), "replacing existing control session");
            existing.close();
        }

        self.stats.new_client(&login.run_id);

        let encryption_token = if self.config.use_encryption {
            Some(self.config.privilege_token.as_bytes().to_vec())
        } else {
            None
        };
        let (control, new_proxy_rx, stopped_rx) = control::spawn(
            conn,
            login.run_id.clone(),
            login.pool_count.max(1),
            Duration::from_secs(self.config.heart_beat_timeout),
            Duration::from_secs(self.config.user_conn_timeout),
            env!("CARGO_PKG_VERSION").to_string(),
            encryption_token,
        )
        .await?;

        self.controls.insert(login.run_id.clone(), control.clone());
        info!(run_id = login.run_id.as_str(), peer = %peer, "client logged in");

        let this = self.clone();
        tokio::spawn(async move { this.drain_new_proxy_requests(new_proxy_rx).await });

        let this = self.clone();
        let run_id = login.run_id.clone();
        let exiting = control.clone();
        tokio::spawn(async move {
            let _ = stopped_rx.await;
            this.on_control_closed(&run_id, &exiting).await;
        });

        Ok(())
    }

    /// Only removes/unregisters state if `exiting` is still the session
    /// registered under `run_id`: a replacement login swaps in a new
    /// `Control` before the old one's `stopped_rx` fires, and the old
    /// session's teardown must not clobber the new one's state (spec
    /// §4.E, §8 invariant 1, scenario S3).
    async fn on_control_closed(self: Arc<Self>, run_id: &str, exiting: &Control) {
        info!(run_id, "control session closed, releasing client state");
        let removed = self.controls.remove_if(run_id, |_, c| c.same_session(exiting));
        if let Some((_, control)) = removed {
            for record in control.take_proxies() {
                self.unregister_proxy(record);
            }
            self.stats.close_client(run_id);
        }
        // Port reservations deliberately survive here; they're released
        // only by an explicit admin action (see design notes).
    }

    /// Frees everything a single proxy registration holds: its entry in
    /// the global name registry, its stats record, its vhost routes (if
    /// any), and its listener/dispatch task (spec §4.E's "close every
    /// proxy", §8 invariant 2).
    fn unregister_proxy(&self, record: ProxyRecord) {
        self.proxies.unregister(&record.name);
        self.stats.close_proxy(&record.name, &record.proxy_type);
        match record.handle {
            ProxyHandle::Listener(abort) => abort.abort(),
            ProxyHandle::Vhost { is_tls, routes, abort } => {
                let muxer = if is_tls { &self.vhost_https } else { &self.vhost_http };
                for (host, path) in routes {
                    muxer.unregister(&host, &path);
                }
                abort.abort();
            }
        }
    }

    async fn drain_new_proxy_requests(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<NewProxyRequest>) {
        while let Some(request) = rx.recv().await {
            let resp = self.handle_new_proxy(request.run_id.clone(), request.req).await;
            let _ = request.reply.send(resp);
        }
    }

    async fn handle_new_proxy(self: &Arc<Self>, run_id: String, req: NewProxy) -> NewProxyResp {
        match self.register_and_start_proxy(run_id, req.clone()).await {
            Ok(port) => NewProxyResp {
                proxy_name: req.proxy_name,
                remote_port: port,
                error: String::new(),
            },
            Err(e) => NewProxyResp {
                proxy_name: req.proxy_name,
                remote_port: 0,
                error: e.to_string(),
            },
        }
    }

    async fn register_and_start_proxy(self: &Arc<Self>, run_id: String, req: NewProxy) -> Result<u16> {
        self.proxies.register(&req.proxy_name, req.proxy_type.as_str())?;
        self.stats.new_proxy(&req.proxy_name, req.proxy_type.as_str(), &run_id);

        let control = self
            .controls
            .get(&run_id)
            .map(|c| c.clone())
            .ok_or_else(|| TunnelError::ControlClosed)?;
        let encryption_token = if self.config.use_encryption {
            Some(Arc::new(self.config.privilege_token.as_bytes().to_vec()))
        } else {
            None
        };
        let base = BaseProxy {
            name: req.proxy_name.clone(),
            run_id: run_id.clone(),
            proxy_type: req.proxy_type.as_str().to_string(),
            pool: control.work_conn_pool(),
            stats: self.stats.clone(),
            encoding: EncodingInfo {
                use_encryption: req.use_encryption,
                use_compression: req.use_compression,
                encryption_token,
            },
        };

        match req.proxy_type {
            ProxyType::Tcp => {
                let (port, abort) = self.start_tcp_proxy(base, &run_id, req.remote_port).await?;
                control.record_proxy(ProxyRecord {
                    name: req.proxy_name.clone(),
                    proxy_type: "tcp".to_string(),
                    handle: ProxyHandle::Listener(abort),
                });
                Ok(port)
            }
            ProxyType::Udp => {
                let (port, abort) = self.start_udp_proxy(base, &run_id, req.remote_port).await?;
                control.record_proxy(ProxyRecord {
                    name: req.proxy_name.clone(),
                    proxy_type: "udp".to_string(),
                    handle: ProxyHandle::Listener(abort),
                });
                Ok(port)
            }
            ProxyType::Http => {
                let (routes, abort) = self.start_http_proxy(base, &req, false).await?;
                control.record_proxy(ProxyRecord {
                    name: req.proxy_name.clone(),
                    proxy_type: "http".to_string(),
                    handle: ProxyHandle::Vhost { is_tls: false, routes, abort },
                });
                Ok(0)
            }
            ProxyType::Https => {
                let (routes, abort) = self.start_http_proxy(base, &req, true).await?;
                control.record_proxy(ProxyRecord {
                    name: req.proxy_name.clone(),
                    proxy_type: "https".to_string(),
                    handle: ProxyHandle::Vhost { is_tls: true, routes, abort },
                });
                Ok(0)
            }
            ProxyType::Ftp => {
                let (port, abort) = self.start_ftp_proxy(&control, base, &run_id, &req).await?;
                control.record_proxy(ProxyRecord {
                    name: req.proxy_name.clone(),
                    proxy_type: "ftp".to_string(),
                    handle: ProxyHandle::Listener(abort),
                });
                Ok(port)
            }
        }
    }

    async fn reserve_or_probe(&self, run_id: &str, requested: u16) -> Result<(u16, TcpListener)> {
        if requested != 0 {
            if let Some(owner) = self.reserved_ports.get(&requested) {
                if owner.as_str() != run_id {
                    return Err(TunnelError::Config(format!(
                        "port {requested} is already reserved by another client"
                    )));
                }
            }
            let addr: SocketAddr = format!("{}:{}", self.config.bind_addr, requested)
                .parse()
                .map_err(|e| TunnelError::Config(e.to_string()))?;
            let listener = TcpListener::bind(addr).await.map_err(|_| TunnelError::PortUnavailable)?;
            self.reserved_ports.insert(requested, run_id.to_string());
            Ok((requested, listener))
        } else {
            let port = self.ports.get_free_port(run_id).await?;
            let addr: SocketAddr = format!("{}:{}", self.config.bind_addr, port)
                .parse()
                .map_err(|e| TunnelError::Config(e.to_string()))?;
            let listener = TcpListener::bind(addr).await.map_err(|_| TunnelError::PortUnavailable)?;
            Ok((port, listener))
        }
    }

    async fn start_tcp_proxy(&self, base: BaseProxy, run_id: &str, requested_port: u16) -> Result<(u16, AbortHandle)> {
        let (port, listener) = self.reserve_or_probe(run_id, requested_port).await?;
        let handle = tokio::spawn(async move { TcpProxy::new(base).run(listener).await });
        Ok((port, handle.abort_handle()))
    }

    async fn start_udp_proxy(&self, base: BaseProxy, run_id: &str, requested_port: u16) -> Result<(u16, AbortHandle)> {
        let port = if requested_port != 0 {
            requested_port
        } else {
            self.ports.get_free_port(run_id).await?
        };
        let addr: SocketAddr = format!("{}:{}", self.config.bind_addr, port)
            .parse()
            .map_err(|e| TunnelError::Config(e.to_string()))?;
        let socket = UdpSocket::bind(addr).await.map_err(|_| TunnelError::PortUnavailable)?;
        let handle = tokio::spawn(async move { UdpProxy::new(base).run(socket).await });
        Ok((port, handle.abort_handle()))
    }

    /// Also registers and records the companion `<name>_ftp_data_proxy`
    /// directly on `control`, since it's a second proxy name the session
    /// owns but isn't the one `register_and_start_proxy`'s caller is
    /// replying about.
    async fn start_ftp_proxy(
        &self,
        control: &Control,
        base: BaseProxy,
        run_id: &str,
        req: &NewProxy,
    ) -> Result<(u16, AbortHandle)> {
        let (control_port, listener) = self.reserve_or_probe(run_id, req.remote_port).await?;
        let data_port = self.ports.get_ftp_port(run_id).await?;
        let public_ip = parse_ipv4(&self.config.server_addr).unwrap_or([0, 0, 0, 0]);

        let ftp = FtpProxy::new(base.clone(), public_ip, data_port);
        let ftp_handle = tokio::spawn(async move { ftp.run(listener).await });

        let data_name = ProxyRegistry::ftp_data_proxy_name(&req.proxy_name);
        self.proxies.register(&data_name, "tcp")?;
        self.stats.new_proxy(&data_name, "tcp", run_id);
        let data_addr: SocketAddr = format!("{}:{}", self.config.bind_addr, data_port)
            .parse()
            .map_err(|e| TunnelError::Config(e.to_string()))?;
        let data_listener = TcpListener::bind(data_addr).await.map_err(|_| TunnelError::PortUnavailable)?;
        let data_base = BaseProxy {
            name: data_name.clone(),
            ..base
        };
        let data_handle = tokio::spawn(async move { TcpProxy::new(data_base).run(data_listener).await });
        control.record_proxy(ProxyRecord {
            name: data_name,
            proxy_type: "tcp".to_string(),
            handle: ProxyHandle::Listener(data_handle.abort_handle()),
        });

        Ok((control_port, ftp_handle.abort_handle()))
    }

    async fn start_http_proxy(
        &self,
        base: BaseProxy,
        req: &NewProxy,
        is_tls: bool,
    ) -> Result<(Vec<(String, String)>, AbortHandle)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let muxer = if is_tls { &self.vhost_https } else { &self.vhost_http };

        let domains = vhost_domains(req, &self.config.subdomain_host);
        let paths = if req.locations.is_empty() {
            vec!["/".to_string()]
        } else {
            req.locations.clone()
        };

        let mut registered = Vec::new();
        for domain in &domains {
            for path in &paths {
                let route = VhostRoute {
                    proxy_name: req.proxy_name.clone(),
                    host_header_rewrite: req.host_header_rewrite.clone(),
                    http_user: req.http_user.clone(),
                    http_pwd: req.http_pwd.clone(),
                    sender: tx.clone(),
                };
                if let Err(e) = muxer.register(domain, path, route) {
                    for (host, path) in &registered {
                        muxer.unregister(host, path);
                    }
                    return Err(e);
                }
                registered.push((domain.clone(), path.clone()));
            }
        }

        let handle = tokio::spawn(async move { TcpProxy::new(base).run_from_vhost(rx).await });
        Ok((registered, handle.abort_handle()))
    }
}

fn vhost_domains(req: &NewProxy, subdomain_host: &str) -> Vec<String> {
    if !req.custom_domains.is_empty() {
        return req.custom_domains.clone();
    }
    if !req.sub_domain.is_empty() && !subdomain_host.is_empty() {
        return vec![format!("{}.{}", req.sub_domain, subdomain_host)];
    }
    Vec::new()
}

fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut out = [0u8; 4];
    for (i, p) in parts.iter().enumerate() {
        out[i] = p.parse().ok()?;
    }
    Some(out)
}

fn debug_or_warn(peer: SocketAddr, e: &TunnelError) {
    match e {
        TunnelError::PeekTimeout | TunnelError::UnknownType(_) => {
            tracing::debug!(peer = %peer, error = %e, "vhost routing failed");
        }
        _ => warn!(peer = %peer, error = %e, "vhost routing failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            vhost_http_port: 0,
            vhost_https_port: 0,
            dashboard_port: 0,
            ..ServerConfig::default()
        }
    }

    fn tcp_new_proxy(name: &str, run_id: &str) -> NewProxy {
        NewProxy {
            proxy_name: name.to_string(),
            proxy_type: ProxyType::Tcp,
            remote_port: 0,
            use_encryption: false,
            use_compression: false,
            custom_domains: Vec::new(),
            sub_domain: String::new(),
            locations: Vec::new(),
            host_header_rewrite: String::new(),
            http_user: String::new(),
            http_pwd: String::new(),
            remote_data_port: 0,
            ftp_cfg_proxy_name: String::new(),
            run_id: run_id.to_string(),
        }
    }

    /// Spawns a control session directly (bypassing the main accept loop),
    /// registers it on the service, and drains its `NewProxy` requests the
    /// way `handle_login` does.
    async fn spin_up_control(service: &Arc<Service>, run_id: &str) -> (Control, oneshot::Receiver<()>) {
        let (_client, server) = tokio::io::duplex(4096);
        let (control, new_proxy_rx, stopped_rx) = control::spawn(
            server,
            run_id.to_string(),
            1,
            Duration::from_secs(30),
            Duration::from_secs(30),
            "test".to_string(),
            None,
        )
        .await
        .unwrap();
        service.controls.insert(run_id.to_string(), control.clone());
        let this = service.clone();
        tokio::spawn(async move { this.drain_new_proxy_requests(new_proxy_rx).await });
        (control, stopped_rx)
    }

    #[tokio::test]
    async fn closing_a_session_frees_its_proxy_name_for_reuse() {
        let service = Service::new(test_config());
        let (control, stopped_rx) = spin_up_control(&service, "X").await;

        let port = service
            .register_and_start_proxy("X".to_string(), tcp_new_proxy("t", "X"))
            .await
            .expect("first registration should succeed");
        assert!(port > 0);

        // Re-registering the same name while the session is alive is a
        // collision (invariant 2: at most one owner per name).
        assert!(matches!(
            service
                .register_and_start_proxy("X".to_string(), tcp_new_proxy("t", "X"))
                .await,
            Err(TunnelError::AlreadyRegistered(_))
        ));

        control.close();
        stopped_rx.await.unwrap();
        service.clone().on_control_closed("X", &control).await;

        assert!(!service.proxies.contains("t"));

        // A reconnect with the same RunId re-registering the same proxy
        // name must now succeed (spec §8 invariant 2, scenario S3).
        let (_control2, _stopped2) = spin_up_control(&service, "X").await;
        let port2 = service
            .register_and_start_proxy("X".to_string(), tcp_new_proxy("t", "X"))
            .await
            .expect("name should be free again after the old session closed");
        assert!(port2 > 0);
    }

    /// Reproduces scenario S3: when a second login replaces an existing
    /// `RunId`, the old session's (delayed) teardown must not evict the
    /// new session from `Service.controls` (spec §8 invariant 1).
    #[tokio::test]
    async fn old_sessions_teardown_does_not_evict_its_replacement() {
        let service = Service::new(test_config());
        let (old_control, old_stopped_rx) = spin_up_control(&service, "X").await;

        // A replacement login overwrites the registry entry before the
        // old session's stopper has actually run (handle_login does the
        // same: `existing.close()` then immediately inserts the new one).
        old_control.close();
        let (new_control, _new_stopped_rx) = spin_up_control(&service, "X").await;

        old_stopped_rx.await.unwrap();
        service.clone().on_control_closed("X", &old_control).await;

        let current = service.controls.get("X").expect("new session must still be registered");
        assert!(current.same_session(&new_control));
    }
}
