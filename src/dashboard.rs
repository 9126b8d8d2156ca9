//! xtunneld/src/dashboard.rs
//! Read-only dashboard query surface over the live statistics and proxy
//! registry. This module answers "what would the dashboard API return",
//! not how it's served over HTTP -- the transport and the static asset
//! bundle stay out of scope.

use serde::Serialize;

use crate::service::Service;
use crate::stats::{ClientSnapshot, ProxySnapshot};

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Serialize, Debug, Clone)]
pub struct ServerInfoResp {
    pub version: String,
    pub bind_port: u16,
    pub vhost_http_port: u16,
    pub vhost_https_port: u16,
    pub total_traffic_in: i64,
    pub total_traffic_out: i64,
    pub cur_conns: i64,
    pub client_counts: i64,
    pub proxy_type_counts: std::collections::HashMap<String, i64>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Page<T> {
    pub page_no: usize,
    pub page_size: usize,
    pub total_num: usize,
    pub total_page: usize,
    pub items: Vec<T>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ClientInfoResp {
    pub run_id: String,
    pub proxy_num: i64,
    pub conn_num: i64,
}

#[derive(Serialize, Debug, Clone)]
pub struct ProxyInfoResp {
    pub name: String,
    pub run_id: String,
    pub proxy_type: String,
    pub today_traffic_in: i64,
    pub today_traffic_out: i64,
    pub cur_conns: i64,
}

#[derive(Serialize, Debug, Clone)]
pub struct ProxyTrafficResp {
    pub name: String,
    pub traffic_in: Vec<i64>,
    pub traffic_out: Vec<i64>,
}

pub fn server_info(service: &Service) -> ServerInfoResp {
    let snap = service.stats.server_snapshot();
    ServerInfoResp {
        version: env!("CARGO_PKG_VERSION").to_string(),
        bind_port: service.config().bind_port,
        vhost_http_port: service.config().vhost_http_port,
        vhost_https_port: service.config().vhost_https_port,
        total_traffic_in: snap.total_traffic_in,
        total_traffic_out: snap.total_traffic_out,
        cur_conns: snap.cur_conns,
        client_counts: snap.client_counts,
        proxy_type_counts: snap.proxy_type_counts,
    }
}

pub fn clients(service: &Service, online_only: bool, page_no: usize, page_size: usize) -> Page<ClientInfoResp> {
    let all = service.stats.clients_by_status(online_only);
    paginate(all, page_no, page_size.min(DEFAULT_PAGE_SIZE)).map_items(|c: ClientSnapshot| ClientInfoResp {
        run_id: c.run_id,
        proxy_num: c.proxy_num,
        conn_num: c.conn_num,
    })
}

pub fn proxies_by_type(service: &Service, proxy_type: &str, page_no: usize, page_size: usize) -> Page<ProxyInfoResp> {
    let all = service.stats.proxies_by_type(proxy_type);
    paginate(all, page_no, page_size.min(DEFAULT_PAGE_SIZE)).map_items(|p: ProxySnapshot| ProxyInfoResp {
        name: p.name,
        run_id: p.run_id,
        proxy_type: p.proxy_type,
        today_traffic_in: p.today_traffic_in,
        today_traffic_out: p.today_traffic_out,
        cur_conns: p.cur_conns,
    })
}

/// Last `RESERVE_DAYS` days of traffic for one named proxy, or `None` if
/// it isn't registered.
pub fn proxy_traffic(service: &Service, name: &str) -> Option<ProxyTrafficResp> {
    service.stats.proxy_traffic(name).map(|t| ProxyTrafficResp {
        name: t.name,
        traffic_in: t.traffic_in,
        traffic_out: t.traffic_out,
    })
}

fn paginate<T: Clone>(all: Vec<T>, page_no: usize, page_size: usize) -> Page<T> {
    let page_size = if page_size == 0 { DEFAULT_PAGE_SIZE } else { page_size };
    let total_num = all.len();
    let total_page = total_num.div_ceil(page_size).max(1);
    let start = page_no.saturating_mul(page_size).min(total_num);
    let end = (start + page_size).min(total_num);
    Page {
        page_no,
        page_size,
        total_num,
        total_page,
        items: all[start..end].to_vec(),
    }
}

impl<T> Page<T> {
    fn map_items<U>(self, f: impl Fn(T) -> U) -> Page<U> {
        Page {
            page_no: self.page_no,
            page_size: self.page_size,
            total_num: self.total_num,
            total_page: self.total_page,
            items: self.items.into_iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_splits_and_reports_totals() {
        let items: Vec<i32> = (0..250).collect();
        let page = paginate(items, 2, 100);
        assert_eq!(page.items.len(), 50);
        assert_eq!(page.total_num, 250);
        assert_eq!(page.total_page, 3);
    }

    #[test]
    fn pagination_past_the_end_is_empty_not_an_error() {
        let items: Vec<i32> = (0..10).collect();
        let page = paginate(items, 5, 100);
        assert!(page.items.is_empty());
        assert_eq!(page.total_page, 1);
    }
}
