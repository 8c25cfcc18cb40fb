//! Connection facade over any async byte stream.

pub mod connection;

pub use connection::{Connection, ConnectionBuilder, PostRekeyHook, PreRekeyHook};
