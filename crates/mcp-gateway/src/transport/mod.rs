//! Transport connectors.
//!
//! One connector per backend transport tag. Each connector owns request
//! serialization, session propagation, and reply correlation for its wire
//! protocol; the registry decides when connections are created and reclaimed.

pub mod exec;
pub mod http;
pub mod sse;
pub mod stdio_tcp;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Header carrying the MCP session identifier, relayed in both directions.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Per-connection counters, incremented with relaxed atomics.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    requests: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time view of [`ConnectionStats`] for the API surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl ConnectionStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counts() {
        let stats = ConnectionStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_failure();
        stats.record_timeout();

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.timeouts, 1);
    }
}
