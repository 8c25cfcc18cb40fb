//! # Core Framing Components
//!
//! Low-level frame handling for the secure stream.
//!
//! ## Components
//! - **Packet**: frame headers and raw frames
//! - **Codec**: Tokio codec plus the reader/writer halves that seal and open frames
//! - **Budget**: byte accounting for the current session key
//!
//! ## Wire Format
//! ```text
//! rekey:            [0]
//! data (no cipher): [1] [len:8 LE] [payload]
//! data (cipher):    [1] [nonceLen:8 LE] [nonce] [ctLen:8 LE] [ciphertext+tag]
//! ```
//!
//! ## Security
//! - Declared lengths are validated before allocation
//! - Received bytes are charged to the budget before authentication

pub mod budget;
pub mod codec;
pub mod packet;
