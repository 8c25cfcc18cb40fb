//! Byte accounting for the current session key.
//!
//! Counts plaintext bytes sent and wire bytes received while a session cipher
//! is active. The counter is reset whenever a rekey starts and again when it
//! completes successfully.

use crate::config::SessionConfig;
use crate::error::{ProtocolError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct ByteBudget {
    used: AtomicU64,
    reject_after: u64,
    max_packet: u64,
}

impl ByteBudget {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            used: AtomicU64::new(0),
            reject_after: config.reject_after_bytes,
            max_packet: config.max_packet_length,
        }
    }

    /// Bytes processed under the current key
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes left before the hard ceiling is hit
    pub fn remaining(&self) -> u64 {
        self.reject_after.saturating_sub(self.used())
    }

    /// Largest length a single packet may declare
    pub fn max_packet(&self) -> u64 {
        self.max_packet
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }

    /// Overwrite the counter. Values past the hard ceiling are refused.
    pub fn set(&self, value: u64) -> Result<()> {
        if value > self.reject_after {
            return Err(ProtocolError::TooHighCounterState(value));
        }
        self.used.store(value, Ordering::Release);
        Ok(())
    }

    /// Add bytes that already left this side. Returns the new total.
    pub fn record(&self, bytes: u64) -> Result<u64> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes)
            })
            .map(|previous| previous + bytes)
            .map_err(ProtocolError::TooHighCounterState)
    }

    /// Charge bytes read off the wire, before they are authenticated.
    ///
    /// The bytes stay counted even when the packet is rejected.
    pub fn charge(&self, bytes: u64) -> Result<u64> {
        let total = self.record(bytes)?;
        if bytes > self.max_packet || total >= self.reject_after {
            return Err(ProtocolError::TooLargePacket(bytes));
        }
        Ok(total)
    }
}
