//! # Secure Stream
//!
//! Authenticated encryption for any reliable, ordered async byte stream, with
//! the session key renegotiated in-band as traffic accumulates.
//!
//! Both peers hold the same pre-shared base key. Upgrading a stream runs a
//! handshake that derives a fresh ChaCha20-Poly1305 session key from the base
//! key and 64 bytes of random material, then proves both sides derived the
//! same key with an encrypted challenge. Once the bytes sent and received
//! under one key cross [`SessionConfig::rekey_after_bytes`], the same
//! handshake runs again without interrupting the connection.
//!
//! ## Modules
//! - [`config`]: session limits and logging configuration
//! - [`core`]: wire frames, codec and byte budget
//! - [`protocol`]: session state and the rekey procedure
//! - [`transport`]: the [`Connection`] facade
//! - [`utils`]: cryptography, metrics and logging helpers
//!
//! ## Example
//! ```rust,no_run
//! use secure_stream::Connection;
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> secure_stream::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:7000").await?;
//! let conn = Connection::upgrade(stream, false, b"pre-shared key").await?;
//!
//! conn.send(b"ping").await?;
//! let reply = conn.receive().await?;
//! assert_eq!(reply, b"pong");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::{SessionConfig, StreamConfig};
pub use error::{ProtocolError, Result};
pub use protocol::{RekeyEvent, RekeyTrigger, Role};
pub use transport::{Connection, ConnectionBuilder};
pub use utils::{Metrics, MetricsSnapshot};
