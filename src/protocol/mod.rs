//! Session state and the rekey procedure.

pub mod rekey;
pub mod state;

#[cfg(test)]
mod tests;

pub use rekey::{Handshake, RekeyEvent, RekeyTrigger, Role};
pub use state::SessionState;
