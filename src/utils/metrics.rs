//! Observability and Metrics
//!
//! Per-connection counters for rekeys and encrypted traffic.
//!
//! Uses atomic counters so the send and receive paths can record without
//! taking a lock. A single [`Metrics`] may be shared by many connections.

use crate::error::ProtocolError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for secure stream operations
#[derive(Debug)]
pub struct Metrics {
    /// Rekey attempts, including the initial handshake
    pub rekeys_total: AtomicU64,
    /// Rekeys that installed a new session cipher
    pub rekeys_success: AtomicU64,
    /// Rekeys that left the connection without a cipher
    pub rekeys_failed: AtomicU64,
    /// Failed challenge/response checks and tag mismatches
    pub verification_failures: AtomicU64,
    /// Application packets sent
    pub packets_sent: AtomicU64,
    /// Application packets received
    pub packets_received: AtomicU64,
    /// Application payload bytes sent
    pub bytes_sent: AtomicU64,
    /// Application payload bytes received
    pub bytes_received: AtomicU64,
    /// Protocol errors reported to callers
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            rekeys_total: AtomicU64::new(0),
            rekeys_success: AtomicU64::new(0),
            rekeys_failed: AtomicU64::new(0),
            verification_failures: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a rekey attempt
    pub fn rekey_attempt(&self) {
        self.rekeys_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful rekey
    pub fn rekey_success(&self) {
        self.rekeys_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed rekey
    pub fn rekey_failed(&self, error: &ProtocolError) {
        self.rekeys_failed.fetch_add(1, Ordering::Relaxed);
        if error.is_verification_failure() {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an application packet sent
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record an application packet received
    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record an error returned from send or receive
    pub fn protocol_error(&self, error: &ProtocolError) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        if matches!(error, ProtocolError::DecryptionFailure) {
            self.verification_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rekeys_total: self.rekeys_total.load(Ordering::Relaxed),
            rekeys_success: self.rekeys_success.load(Ordering::Relaxed),
            rekeys_failed: self.rekeys_failed.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            rekeys_total = snapshot.rekeys_total,
            rekeys_success = snapshot.rekeys_success,
            rekeys_failed = snapshot.rekeys_failed,
            verification_failures = snapshot.verification_failures,
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Secure stream metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rekeys_total: u64,
    pub rekeys_success: u64,
    pub rekeys_failed: u64,
    pub verification_failures: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rekey_counters() {
        let metrics = Metrics::new();
        metrics.rekey_attempt();
        metrics.rekey_success();
        metrics.rekey_attempt();
        metrics.rekey_failed(&ProtocolError::VerificationFailed);
        metrics.rekey_attempt();
        metrics.rekey_failed(&ProtocolError::ConnectionClosed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rekeys_total, 3);
        assert_eq!(snapshot.rekeys_success, 1);
        assert_eq!(snapshot.rekeys_failed, 2);
        assert_eq!(snapshot.verification_failures, 1);
    }

    #[test]
    fn test_traffic_counters() {
        let metrics = Metrics::default();
        metrics.packet_sent(4);
        metrics.packet_sent(6);
        metrics.packet_received(4);
        metrics.protocol_error(&ProtocolError::DecryptionFailure);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.bytes_sent, 10);
        assert_eq!(snapshot.packets_received, 1);
        assert_eq!(snapshot.bytes_received, 4);
        assert_eq!(snapshot.protocol_errors, 1);
        assert_eq!(snapshot.verification_failures, 1);
    }
}
