//! xtunneld/src/stats.rs
//! Streaming statistics: date-bucketed traffic counters, per-proxy and
//! per-client aggregates, a 7-day retention reaper.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// Single source of truth for the retention window, used both by the
/// reaper and by `DateCounter::last`.
pub const RESERVE_DAYS: i64 = 7;

fn current_day() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
        / 86400
}

/// A monotonic counter bucketed by calendar day, retaining a rolling
/// window of days for `last(n)`.
pub struct DateCounter {
    days: DashMap<i64, AtomicI64>,
}

impl DateCounter {
    pub fn new() -> Self {
        DateCounter {
            days: DashMap::new(),
        }
    }

    pub fn inc(&self, delta: i64) {
        self.inc_on_day(current_day(), delta);
    }

    fn inc_on_day(&self, day: i64, delta: i64) {
        self.days
            .entry(day)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::SeqCst);
    }

    pub fn today(&self) -> i64 {
        self.count_on_day(current_day())
    }

    fn count_on_day(&self, day: i64) -> i64 {
        self.days
            .get(&day)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Last `n` daily values, oldest first, today last.
    pub fn last(&self, n: i64) -> Vec<i64> {
        let today = current_day();
        (0..n).rev().map(|back| self.count_on_day(today - back)).collect()
    }

    #[cfg(test)]
    pub fn inc_test_day(&self, day: i64, delta: i64) {
        self.inc_on_day(day, delta);
    }

    #[cfg(test)]
    pub fn last_from_day(&self, today: i64, n: i64) -> Vec<i64> {
        (0..n).rev().map(|back| self.count_on_day(today - back)).collect()
    }
}

impl Default for DateCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ClientStatistics {
    pub online: AtomicBool,
    pub proxy_num: AtomicI64,
    pub conn_num: AtomicI64,
    pub last_start: std::sync::Mutex<Option<Instant>>,
    pub last_close: std::sync::Mutex<Option<Instant>>,
}

impl ClientStatistics {
    fn new() -> Self {
        ClientStatistics {
            online: AtomicBool::new(false),
            proxy_num: AtomicI64::new(0),
            conn_num: AtomicI64::new(0),
            last_start: std::sync::Mutex::new(None),
            last_close: std::sync::Mutex::new(None),
        }
    }
}

pub struct ProxyStatistics {
    pub run_id: String,
    pub proxy_type: String,
    pub traffic_in: DateCounter,
    pub traffic_out: DateCounter,
    pub cur_conns: AtomicI64,
    pub last_start: std::sync::Mutex<Option<Instant>>,
    pub last_close: std::sync::Mutex<Option<Instant>>,
}

/// Date-bucketed counters and per-proxy/per-client aggregates, gated by a
/// dashboard-enabled flag checked at the top of every public mutator: when
/// disabled, they're all no-ops.
pub struct ServerStatistics {
    enabled: AtomicBool,
    total_traffic_in: DateCounter,
    total_traffic_out: DateCounter,
    cur_conns: AtomicI64,
    client_counts: AtomicI64,
    proxy_type_counts: DashMap<String, AtomicI64>,
    proxies: DashMap<String, ProxyStatistics>,
    clients: DashMap<String, ClientStatistics>,
}

impl ServerStatistics {
    pub fn new(enabled: bool) -> Self {
        ServerStatistics {
            enabled: AtomicBool::new(enabled),
            total_traffic_in: DateCounter::new(),
            total_traffic_out: DateCounter::new(),
            cur_conns: AtomicI64::new(0),
            client_counts: AtomicI64::new(0),
            proxy_type_counts: DashMap::new(),
            proxies: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn new_client(&self, run_id: &str) {
        if !self.enabled() {
            return;
        }
        self.client_counts.fetch_add(1, Ordering::SeqCst);
        let stats = self
            .clients
            .entry(run_id.to_string())
            .or_insert_with(ClientStatistics::new);
        stats.online.store(true, Ordering::SeqCst);
        *stats.last_start.lock().unwrap() = Some(Instant::now());
    }

    pub fn close_client(&self, run_id: &str) {
        if !self.enabled() {
            return;
        }
        self.client_counts.fetch_sub(1, Ordering::SeqCst);
        if let Some(stats) = self.clients.get(run_id) {
            stats.online.store(false, Ordering::SeqCst);
            *stats.last_close.lock().unwrap() = Some(Instant::now());
        }
    }

    pub fn new_proxy(&self, name: &str, proxy_type: &str, run_id: &str) {
        if !self.enabled() {
            return;
        }
        self.proxy_type_counts
            .entry(proxy_type.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst);

        if let Some(client) = self.clients.get(run_id) {
            client.proxy_num.fetch_add(1, Ordering::SeqCst);
        }

        let should_replace = self
            .proxies
            .get(name)
            .map(|p| p.proxy_type != proxy_type)
            .unwrap_or(true);
        if should_replace {
            self.proxies.insert(
                name.to_string(),
                ProxyStatistics {
                    run_id: run_id.to_string(),
                    proxy_type: proxy_type.to_string(),
                    traffic_in: DateCounter::new(),
                    traffic_out: DateCounter::new(),
                    cur_conns: AtomicI64::new(0),
                    last_start: std::sync::Mutex::new(None),
                    last_close: std::sync::Mutex::new(None),
                },
            );
        }
        if let Some(p) = self.proxies.get(name) {
            *p.last_start.lock().unwrap() = Some(Instant::now());
        }
    }

    pub fn close_proxy(&self, name: &str, proxy_type: &str) {
        if !self.enabled() {
            return;
        }
        if let Some(counter) = self.proxy_type_counts.get(proxy_type) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(p) = self.proxies.get(name) {
            *p.last_close.lock().unwrap() = Some(Instant::now());
            if let Some(client) = self.clients.get(&p.run_id) {
                client.proxy_num.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    pub fn open_connection(&self, name: &str) {
        if !self.enabled() {
            return;
        }
        self.cur_conns.fetch_add(1, Ordering::SeqCst);
        if let Some(p) = self.proxies.get(name) {
            p.cur_conns.fetch_add(1, Ordering::SeqCst);
            if let Some(client) = self.clients.get(&p.run_id) {
                client.conn_num.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    pub fn close_connection(&self, name: &str) {
        if !self.enabled() {
            return;
        }
        self.cur_conns.fetch_sub(1, Ordering::SeqCst);
        if let Some(p) = self.proxies.get(name) {
            p.cur_conns.fetch_sub(1, Ordering::SeqCst);
            if let Some(client) = self.clients.get(&p.run_id) {
                client.conn_num.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    pub fn add_traffic_in(&self, name: &str, bytes: i64) {
        if !self.enabled() {
            return;
        }
        self.total_traffic_in.inc(bytes);
        if let Some(p) = self.proxies.get(name) {
            p.traffic_in.inc(bytes);
        }
    }

    pub fn add_traffic_out(&self, name: &str, bytes: i64) {
        if !self.enabled() {
            return;
        }
        self.total_traffic_out.inc(bytes);
        if let Some(p) = self.proxies.get(name) {
            p.traffic_out.inc(bytes);
        }
    }

    /// Snapshot of the server-wide counters: getters return copies,
    /// never internal maps.
    pub fn server_snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            total_traffic_in: self.total_traffic_in.today(),
            total_traffic_out: self.total_traffic_out.today(),
            cur_conns: self.cur_conns.load(Ordering::SeqCst),
            client_counts: self.client_counts.load(Ordering::SeqCst),
            proxy_type_counts: self
                .proxy_type_counts
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::SeqCst)))
                .collect(),
        }
    }

    pub fn clients_by_status(&self, online: bool) -> Vec<ClientSnapshot> {
        self.clients
            .iter()
            .filter(|e| e.online.load(Ordering::SeqCst) == online)
            .map(|e| ClientSnapshot {
                run_id: e.key().clone(),
                proxy_num: e.proxy_num.load(Ordering::SeqCst),
                conn_num: e.conn_num.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub fn proxies_by_type(&self, proxy_type: &str) -> Vec<ProxySnapshot> {
        self.proxies
            .iter()
            .filter(|e| e.proxy_type == proxy_type)
            .map(|e| ProxySnapshot {
                name: e.key().clone(),
                run_id: e.run_id.clone(),
                proxy_type: e.proxy_type.clone(),
                today_traffic_in: e.traffic_in.today(),
                today_traffic_out: e.traffic_out.today(),
                cur_conns: e.cur_conns.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub fn proxy_traffic(&self, name: &str) -> Option<ProxyTrafficSnapshot> {
        self.proxies.get(name).map(|p| ProxyTrafficSnapshot {
            name: name.to_string(),
            traffic_in: p.traffic_in.last(RESERVE_DAYS),
            traffic_out: p.traffic_out.last(RESERVE_DAYS),
        })
    }

    /// Deletes any proxy/client entry whose last close is non-zero and
    /// older than `RESERVE_DAYS`. Intended to be driven by a 12-hour
    /// `tokio::time::interval` background task.
    pub fn reap_stale(&self) {
        let cutoff = Duration::from_secs(RESERVE_DAYS as u64 * 24 * 3600);
        let now = Instant::now();

        self.proxies.retain(|name, p| {
            let stale = p
                .last_close
                .lock()
                .unwrap()
                .map(|t| now.duration_since(t) > cutoff)
                .unwrap_or(false);
            if stale {
                debug!(proxy = name.as_str(), "reaping stale proxy statistics");
            }
            !stale
        });

        self.clients.retain(|run_id, c| {
            let stale = c
                .last_close
                .lock()
                .unwrap()
                .map(|t| now.duration_since(t) > cutoff)
                .unwrap_or(false);
            if stale {
                debug!(run_id = run_id.as_str(), "reaping stale client statistics");
            }
            !stale
        });
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct ServerSnapshot {
    pub total_traffic_in: i64,
    pub total_traffic_out: i64,
    pub cur_conns: i64,
    pub client_counts: i64,
    pub proxy_type_counts: std::collections::HashMap<String, i64>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ClientSnapshot {
    pub run_id: String,
    pub proxy_num: i64,
    pub conn_num: i64,
}

#[derive(Serialize, Debug, Clone)]
pub struct ProxySnapshot {
    pub name: String,
    pub run_id: String,
    pub proxy_type: String,
    pub today_traffic_in: i64,
    pub today_traffic_out: i64,
    pub cur_conns: i64,
}

#[derive(Serialize, Debug, Clone)]
pub struct ProxyTrafficSnapshot {
    pub name: String,
    pub traffic_in: Vec<i64>,
    pub traffic_out: Vec<i64>,
}

/// Spawns the 12-hour reaper loop that evicts stale proxy/client entries.
pub fn spawn_reaper(stats: std::sync::Arc<ServerStatistics>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(12 * 3600));
        loop {
            interval.tick().await;
            debug!("starting periodic statistics reap");
            stats.reap_stale();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_counter_rolls_forward_and_retains_seven() {
        let dc = DateCounter::new();
        let base_day = 100_000i64;
        for d in 0..10 {
            dc.inc_test_day(base_day + d, (d + 1) * 10);
        }
        let last7 = dc.last_from_day(base_day + 9, RESERVE_DAYS);
        assert_eq!(last7.len(), 7);
        // oldest-first: days 3..=9 relative to base_day
        assert_eq!(last7, vec![40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn disabled_stats_are_no_ops() {
        let stats = ServerStatistics::new(false);
        stats.new_client("X");
        stats.new_proxy("p", "tcp", "X");
        stats.add_traffic_in("p", 100);
        let snap = stats.server_snapshot();
        assert_eq!(snap.client_counts, 0);
        assert_eq!(snap.total_traffic_in, 0);
    }

    #[test]
    fn client_lifecycle_updates_counts_and_status() {
        let stats = ServerStatistics::new(true);
        stats.new_client("X");
        assert_eq!(stats.server_snapshot().client_counts, 1);
        assert_eq!(stats.clients_by_status(true).len(), 1);

        stats.close_client("X");
        assert_eq!(stats.server_snapshot().client_counts, 0);
        assert_eq!(stats.clients_by_status(false).len(), 1);
    }

    #[test]
    fn proxy_traffic_and_connection_counters() {
        let stats = ServerStatistics::new(true);
        stats.new_client("X");
        stats.new_proxy("p", "tcp", "X");
        stats.open_connection("p");
        stats.add_traffic_in("p", 1000);
        stats.add_traffic_out("p", 500);

        let snap = stats.proxies_by_type("tcp");
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].cur_conns, 1);
        assert_eq!(snap[0].today_traffic_in, 1000);
        assert_eq!(snap[0].today_traffic_out, 500);

        stats.close_connection("p");
        assert_eq!(stats.proxies_by_type("tcp")[0].cur_conns, 0);
    }
}
