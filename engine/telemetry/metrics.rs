use crate::protocol::Protocol;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{interval, Duration};

pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    binary_requests: AtomicU64,
    http_requests: AtomicU64,
    failed_requests: AtomicU64,
    warmup_queries: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_connections(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_requests(&self, protocol: Protocol) {
        let counter = match protocol {
            Protocol::Binary => &self.binary_requests,
            Protocol::Http => &self.http_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failures(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_warmup_queries(&self, count: u64) {
        self.warmup_queries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn get_connections(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn get_requests(&self, protocol: Protocol) -> u64 {
        match protocol {
            Protocol::Binary => self.binary_requests.load(Ordering::Relaxed),
            Protocol::Http => self.http_requests.load(Ordering::Relaxed),
        }
    }

    pub fn get_failures(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn get_warmup_queries(&self) -> u64 {
        self.warmup_queries.load(Ordering::Relaxed)
    }

    pub async fn report_loop(&self) {
        let mut ticker = interval(REPORT_INTERVAL);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            tracing::info!(
                "Metrics: connections={}, binary_requests={}, http_requests={}, failed={}, warmup_queries={}",
                self.get_connections(),
                self.get_requests(Protocol::Binary),
                self.get_requests(Protocol::Http),
                self.get_failures(),
                self.get_warmup_queries()
            );
        }
    }
}
