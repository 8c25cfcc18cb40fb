//! Session record shared by the send and receive paths.
//!
//! Holds the active cipher, the byte budget for it and the rekey epoch. The
//! cipher is only swapped while both direction locks of the connection are
//! held; readers clone the `Arc` out and never keep the lock across an await.

use crate::config::SessionConfig;
use crate::core::budget::ByteBudget;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::SessionCipher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct SessionState {
    cipher: RwLock<Option<Arc<SessionCipher>>>,
    budget: ByteBudget,
    epoch: AtomicU64,
}

impl SessionState {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            cipher: RwLock::new(None),
            budget: ByteBudget::new(config),
            epoch: AtomicU64::new(0),
        }
    }

    /// Current session cipher, `None` before the first handshake or after a failed rekey
    pub fn cipher(&self) -> Result<Option<Arc<SessionCipher>>> {
        let guard = self
            .cipher
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        Ok(guard.clone())
    }

    pub fn is_established(&self) -> bool {
        matches!(self.cipher(), Ok(Some(_)))
    }

    pub fn budget(&self) -> &ByteBudget {
        &self.budget
    }

    /// Number of rekey attempts started so far
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Start a new epoch and return its number
    pub fn begin_epoch(&self) -> Result<u64> {
        self.epoch
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |epoch| {
                epoch.checked_add(1)
            })
            .map(|previous| previous + 1)
            .map_err(ProtocolError::TooHighCounterState)
    }

    /// Activate a freshly negotiated cipher with an empty budget
    pub fn install(&self, cipher: SessionCipher) -> Result<()> {
        self.replace(Some(Arc::new(cipher)))
    }

    /// Drop the cipher and its counters
    pub fn clear(&self) -> Result<()> {
        self.replace(None)
    }

    fn replace(&self, cipher: Option<Arc<SessionCipher>>) -> Result<()> {
        let mut guard = self
            .cipher
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        *guard = cipher;
        self.budget.reset();
        Ok(())
    }
}
