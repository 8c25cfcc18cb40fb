//! # Utility Modules
//!
//! Supporting utilities for cryptography, logging, and metrics.
//!
//! ## Components
//! - **Crypto**: session key derivation, ChaCha20-Poly1305 sealing, nonce generation
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe rekey and traffic counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Memory zeroing for key material (zeroize crate)

pub mod crypto;
pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
