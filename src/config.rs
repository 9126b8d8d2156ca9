//! xtunneld/src/config.rs
//! Server-side tunables. Parsing from a config file or CLI flags is out of
//! scope; this struct is the in-memory surface callers populate however
//! they like (defaults, env, a hand-rolled loader upstream of this crate).

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,

    pub vhost_http_port: u16,
    pub vhost_https_port: u16,
    pub dashboard_port: u16,

    pub subdomain_host: String,

    /// Seconds of silence before a control session is torn down.
    pub heart_beat_timeout: u64,
    /// Seconds a proxy waits for a replenished work connection.
    pub user_conn_timeout: u64,
    /// Upper bound on a client-requested work-conn pool size.
    pub max_pool_count: usize,

    pub use_encryption: bool,
    pub privilege_token: String,

    /// Public IP address substituted into rewritten FTP PASV responses.
    pub server_addr: String,

    /// Inclusive range probed by the port manager when a client requests
    /// remote_port == 0.
    pub privileged_port_low: u16,
    pub privileged_port_high: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7000,
            vhost_http_port: 8080,
            vhost_https_port: 8443,
            dashboard_port: 7500,
            subdomain_host: String::new(),
            heart_beat_timeout: 90,
            user_conn_timeout: 10,
            max_pool_count: 100,
            use_encryption: false,
            privilege_token: String::new(),
            server_addr: "0.0.0.0".to_string(),
            privileged_port_low: 1024,
            privileged_port_high: 65535,
        }
    }
}
