//! # Error Types
//!
//! Closed error taxonomy for the secure stream.
//!
//! Every failure a [`Connection`](crate::transport::Connection) can report is a
//! variant of [`ProtocolError`], so callers can match exhaustively instead of
//! comparing against sentinel values.
//!
//! ## Error Categories
//! - **I/O Errors**: resets, timeouts and EOF of the underlying stream
//! - **Framing Errors**: unknown or unexpected headers, oversized packets
//! - **Rekey Errors**: failed verification, recursive rekey signals, handshake faults
//! - **Cryptographic Errors**: sealing and opening failures, missing entropy
//! - **Configuration Errors**: invalid limits or logging setup
//!
//! ## Example Usage
//! ```rust
//! use secure_stream::error::{ProtocolError, Result};
//!
//! fn check_len(len: u64, max: u64) -> Result<()> {
//!     if len >= max {
//!         return Err(ProtocolError::TooLargePacket(len));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_len(10, 16).is_ok());
//! assert!(matches!(check_len(16, 16), Err(ProtocolError::TooLargePacket(16))));
//! ```

use crate::core::packet::FrameHeader;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Handshake errors
    pub const ERR_SESSION_KEY_LENGTH: &str = "Derived session key has an invalid length";
    pub const ERR_RANDOM_MATERIAL_LENGTH: &str = "Random key material has an unexpected length";

    /// Cryptographic errors
    pub const ERR_ENTROPY_UNAVAILABLE: &str = "Secure random source unavailable";
}

/// ProtocolError is the primary error type for all stream operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Too large packet: {0} bytes")]
    TooLargePacket(u64),

    #[error("Too high counter state: {0}")]
    TooHighCounterState(u64),

    #[error("Received two rekey requests in a row")]
    RecursiveRekey,

    #[error("Unknown header received: {0:#04x}")]
    UnknownHeaderReceived(u8),

    #[error("Wrong header received: expected {expected}, got {received}")]
    WrongHeaderReceived {
        expected: FrameHeader,
        received: FrameHeader,
    },

    #[error("Verification failed")]
    VerificationFailed,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Session not established")]
    SessionNotEstablished,

    #[error("Random source error: {0}")]
    RandomSource(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True for a failed challenge/response step and for AEAD tag mismatches.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::VerificationFailed | ProtocolError::DecryptionFailure
        )
    }

    /// Whether the connection instance should be abandoned after this error.
    ///
    /// `TooLargePacket` only rejects the offending packet; a missing session is
    /// recovered by a successful rekey. Configuration errors never reach a live
    /// connection. Everything else means the byte stream is desynchronized or gone.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::TooLargePacket(_)
                | ProtocolError::SessionNotEstablished
                | ProtocolError::ConfigError(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
