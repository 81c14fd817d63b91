//! Broker metrics for observability
//!
//! Counters are updated lock-free from sessions and served as a JSON snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Broker-wide metrics
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    // Connection metrics
    /// Currently open client connections (TCP and WebSocket)
    pub active_connections: AtomicU64,
    /// Total connections since start
    pub total_connections: AtomicU64,

    // Brokering metrics
    /// Successful Authenticate calls
    pub authentications: AtomicU64,
    /// ConnectTo calls that produced a token pair
    pub connect_requests: AtomicU64,
    /// Callbacks the client never acknowledged or refused
    pub failed_notifications: AtomicU64,

    // Relay metrics, one per relaying connection
    /// Relay pumps currently running
    pub active_relays: AtomicU64,
    /// Relay pumps started since start
    pub total_relays: AtomicU64,
    /// Bytes forwarded by all pumps
    pub bytes_relayed: AtomicU64,

    start_time: Option<Instant>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn authenticated(&self) {
        self.authentications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_requested(&self) {
        self.connect_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_failed(&self) {
        self.failed_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_started(&self) {
        self.active_relays.fetch_add(1, Ordering::Relaxed);
        self.total_relays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_finished(&self) {
        self.active_relays.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bytes_forwarded(&self, n: u64) {
        self.bytes_relayed.fetch_add(n, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            brokering: BrokeringMetrics {
                authentications: self.authentications.load(Ordering::Relaxed),
                connect_requests: self.connect_requests.load(Ordering::Relaxed),
                failed_notifications: self.failed_notifications.load(Ordering::Relaxed),
            },
            relays: RelayMetrics {
                active: self.active_relays.load(Ordering::Relaxed),
                total: self.total_relays.load(Ordering::Relaxed),
                bytes: self.bytes_relayed.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub brokering: BrokeringMetrics,
    pub relays: RelayMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokeringMetrics {
    pub authentications: u64,
    pub connect_requests: u64,
    pub failed_notifications: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub active: u64,
    pub total: u64,
    pub bytes: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub uptime_secs: u64,
}
