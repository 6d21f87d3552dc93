//! Metrics collection for the legacy Kafka client

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every channel created from one client
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Transport
    pub requests_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub send_retries: AtomicU64,

    // Connections
    pub connections_created: AtomicU64,
    pub connection_errors: AtomicU64,

    // Messages
    pub messages_consumed: AtomicU64,
    pub messages_produced: AtomicU64,
}

impl ClientMetrics {
    /// Record a request written to the socket, size prefix included
    pub fn record_request(&self, byte_count: u64) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_received(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_send_retry(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumed(&self, count: u64) {
        self.messages_consumed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_produced(&self, count: u64) {
        self.messages_produced.fetch_add(count, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            messages_produced: self.messages_produced.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_retries: u64,
    pub connections_created: u64,
    pub connection_errors: u64,
    pub messages_consumed: u64,
    pub messages_produced: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = ClientMetrics::default();
        metrics.record_request(46);
        metrics.record_request(46);
        metrics.record_received(10);
        metrics.record_send_retry();
        metrics.record_connection_created();
        metrics.record_produced(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_sent, 2);
        assert_eq!(snapshot.bytes_sent, 92);
        assert_eq!(snapshot.bytes_received, 10);
        assert_eq!(snapshot.send_retries, 1);
        assert_eq!(snapshot.connections_created, 1);
        assert_eq!(snapshot.messages_produced, 3);
        assert_eq!(snapshot.messages_consumed, 0);
    }
}
