//! xtunneld/src/port.rs
//! Per-client port reservation for the control (TCP) and FTP public ports.

use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

const MAX_PROBE_ATTEMPTS: u32 = 50;

pub struct PortManager {
    tcp_ports: DashMap<String, u16>,
    ftp_ports: DashMap<String, u16>,
    low: u16,
    high: u16,
}

impl PortManager {
    pub fn new(low: u16, high: u16) -> Self {
        PortManager {
            tcp_ports: DashMap::new(),
            ftp_ports: DashMap::new(),
            low,
            high,
        }
    }

    pub fn get_by_id(&self, run_id: &str) -> Option<u16> {
        self.tcp_ports.get(run_id).map(|p| *p)
    }

    pub fn add(&self, run_id: &str, port: u16) {
        self.tcp_ports.insert(run_id.to_string(), port);
    }

    pub fn get_ftp_by_id(&self, run_id: &str) -> Option<u16> {
        self.ftp_ports.get(run_id).map(|p| *p)
    }

    pub fn add_ftp(&self, run_id: &str, port: u16) {
        self.ftp_ports.insert(run_id.to_string(), port);
    }

    pub fn release(&self, run_id: &str) {
        self.tcp_ports.remove(run_id);
        self.ftp_ports.remove(run_id);
    }

    /// Returns this client's reserved TCP port, allocating one if it
    /// doesn't have one yet. Deterministic across re-logins of the same
    /// `run_id` as long as the reservation is held.
    pub async fn get_free_port(&self, run_id: &str) -> Result<u16> {
        if let Some(p) = self.get_by_id(run_id) {
            return Ok(p);
        }
        let port = self.probe_free_port().await?;
        self.add(run_id, port);
        Ok(port)
    }

    pub async fn get_ftp_port(&self, run_id: &str) -> Result<u16> {
        if let Some(p) = self.get_ftp_by_id(run_id) {
            return Ok(p);
        }
        let port = self.probe_free_port().await?;
        self.add_ftp(run_id, port);
        Ok(port)
    }

    async fn probe_free_port(&self) -> Result<u16> {
        for _ in 0..MAX_PROBE_ATTEMPTS {
            let candidate = self.random_port_in_range();
            match TcpListener::bind(("127.0.0.1", candidate)).await {
                Ok(listener) => {
                    drop(listener);
                    debug!(port = candidate, "probed free port");
                    return Ok(candidate);
                }
                Err(_) => continue,
            }
        }
        warn!("no port available after {} probes", MAX_PROBE_ATTEMPTS);
        Err(TunnelError::PortUnavailable)
    }

    fn random_port_in_range(&self) -> u16 {
        rand::Rng::gen_range(&mut rand::thread_rng(), self.low..=self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_by_id_after_add_returns_port() {
        let pm = PortManager::new(1024, 65535);
        pm.add("X", 12345);
        assert_eq!(pm.get_by_id("X"), Some(12345));
        assert_eq!(pm.get_ftp_by_id("X"), None);
    }

    #[tokio::test]
    async fn get_free_port_is_stable_across_calls() {
        let pm = PortManager::new(20000, 20100);
        let p1 = pm.get_free_port("X").await.unwrap();
        let p2 = pm.get_free_port("X").await.unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn release_clears_both_reservations() {
        let pm = PortManager::new(1024, 65535);
        pm.add("X", 1);
        pm.add_ftp("X", 2);
        pm.release("X");
        assert_eq!(pm.get_by_id("X"), None);
        assert_eq!(pm.get_ftp_by_id("X"), None);
    }
}
