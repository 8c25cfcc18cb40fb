//! Session cipher derivation and nonce generation.
//!
//! A session key is `SHA-256(base_key || random_material)` and keys a
//! ChaCha20-Poly1305 AEAD. Every sealed packet gets a fresh random nonce.

use crate::error::{constants, ProtocolError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Nonce size for ChaCha20Poly1305 (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag appended to every ciphertext (128 bits)
pub const TAG_SIZE: usize = 16;

/// Fill `buf` from the operating system's secure random source
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|e| {
        ProtocolError::RandomSource(format!("{}: {e}", constants::ERR_ENTROPY_UNAVAILABLE))
    })
}

/// Generate a cryptographically secure random nonce
pub fn generate_nonce() -> Result<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

/// Fresh random material for key derivation or verification challenges
pub fn random_material(len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut material = Zeroizing::new(vec![0u8; len]);
    fill_random(&mut material)?;
    Ok(material)
}

/// AEAD cipher for one session epoch
pub struct SessionCipher {
    aead: ChaCha20Poly1305,
}

impl SessionCipher {
    /// Derive the session cipher from the long-term key and exchanged material.
    ///
    /// Deterministic: both peers derive the same cipher from the same inputs.
    pub fn derive(base_key: &[u8], material: &[u8]) -> Result<Self> {
        let mut digest: [u8; 32] = Sha256::new()
            .chain_update(base_key)
            .chain_update(material)
            .finalize()
            .into();

        let aead = ChaCha20Poly1305::new_from_slice(&digest);
        digest.zeroize();

        let aead = aead
            .map_err(|_| ProtocolError::HandshakeError(constants::ERR_SESSION_KEY_LENGTH.into()))?;
        Ok(Self { aead })
    }

    pub fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    /// Seal `plaintext` under a fresh nonce. The ciphertext carries the tag.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
        let nonce = generate_nonce()?;
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok((nonce, ciphertext))
    }

    /// Open a ciphertext produced by [`seal`](Self::seal) with the same `aad`.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE || ciphertext.len() < TAG_SIZE {
            return Err(ProtocolError::DecryptionFailure);
        }
        self.aead
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}
