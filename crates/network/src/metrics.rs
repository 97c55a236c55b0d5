use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Datagram counters for a single socket
#[derive(Debug)]
pub struct NetworkMetrics {
    // Datagram counters
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,

    // Byte counters
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    // Failures
    decode_failures: AtomicU64,
    encode_failures: AtomicU64,
    send_failures: AtomicU64,

    start_time: Instant,
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self {
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a datagram handed to the OS
    pub fn record_datagram_sent(&self, bytes: usize) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a datagram read from the socket, before decoding
    pub fn record_datagram_received(&self, bytes: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetworkMetricsSnapshot {
        NetworkMetricsSnapshot {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of socket metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMetricsSnapshot {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub decode_failures: u64,
    pub encode_failures: u64,
    pub send_failures: u64,
    pub uptime_seconds: u64,
}

impl NetworkMetricsSnapshot {
    /// Fraction of received datagrams that decoded cleanly
    pub fn decode_success_rate(&self) -> f64 {
        if self.datagrams_received == 0 {
            return 1.0;
        }
        let decoded = self.datagrams_received.saturating_sub(self.decode_failures);
        decoded as f64 / self.datagrams_received as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = NetworkMetrics::new();

        metrics.record_datagram_sent(100);
        metrics.record_datagram_received(200);
        metrics.record_datagram_received(50);
        metrics.record_decode_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.datagrams_sent, 1);
        assert_eq!(snapshot.datagrams_received, 2);
        assert_eq!(snapshot.bytes_sent, 100);
        assert_eq!(snapshot.bytes_received, 250);
        assert_eq!(snapshot.decode_failures, 1);
        assert!((snapshot.decode_success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_snapshot_rate() {
        let snapshot = NetworkMetricsSnapshot::default();
        assert_eq!(snapshot.decode_success_rate(), 1.0);
    }
}
