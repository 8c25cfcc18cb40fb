//! Frame headers and decoded frames.
//!
//! Every frame on the wire starts with a single header byte. A `rekey` frame
//! is nothing more than that byte; a `data` frame carries either a plain
//! length-prefixed payload (before a session cipher exists) or a
//! length-prefixed nonce followed by a length-prefixed ciphertext.

use crate::config::RANDOM_MATERIAL_LEN;
use crate::error::ProtocolError;
use crate::utils::crypto::{NONCE_SIZE, TAG_SIZE};
use bytes::Bytes;
use std::fmt;

/// Size of every length prefix on the wire (little-endian `u64`)
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Bytes a sealed frame body adds on top of the payload
pub const SEALED_OVERHEAD: u64 = (2 * LENGTH_PREFIX_LEN + NONCE_SIZE + TAG_SIZE) as u64;

/// Largest body a plain frame may declare. Plain frames only carry key material.
pub const MAX_PLAIN_BODY: u64 = (LENGTH_PREFIX_LEN + RANDOM_MATERIAL_LEN) as u64;

/// Body length of the sealed frame carrying `payload_len` bytes.
///
/// Both peers charge this amount per data frame, the sender when it writes
/// the frame and the receiver when it reads it.
pub fn sealed_body_len(payload_len: u64) -> u64 {
    payload_len.saturating_add(SEALED_OVERHEAD)
}

/// First byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameHeader {
    /// Asks the peer to run its side of the rekey procedure
    Rekey = 0,
    /// Carries a payload
    Data = 1,
}

impl FrameHeader {
    /// Wire representation
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameHeader {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(FrameHeader::Rekey),
            1 => Ok(FrameHeader::Data),
            other => Err(ProtocolError::UnknownHeaderReceived(other)),
        }
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameHeader::Rekey => f.write_str("rekey"),
            FrameHeader::Data => f.write_str("data"),
        }
    }
}

/// One frame as it travels on the wire, before any decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `0`
    Rekey,
    /// `1 | len:8 | payload`
    Plain(Bytes),
    /// `1 | nonceLen:8 | nonce | ctLen:8 | ciphertext`
    Sealed { nonce: Bytes, ciphertext: Bytes },
}

impl Frame {
    pub fn header(&self) -> FrameHeader {
        match self {
            Frame::Rekey => FrameHeader::Rekey,
            Frame::Plain(_) | Frame::Sealed { .. } => FrameHeader::Data,
        }
    }

    /// Bytes following the header byte.
    ///
    /// For sealed frames this is what the receiver charges against the
    /// session's byte budget.
    pub fn body_len(&self) -> u64 {
        match self {
            Frame::Rekey => 0,
            Frame::Plain(payload) => (LENGTH_PREFIX_LEN + payload.len()) as u64,
            Frame::Sealed { nonce, ciphertext } => {
                (2 * LENGTH_PREFIX_LEN + nonce.len() + ciphertext.len()) as u64
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::utils::crypto::SessionCipher;

    #[test]
    fn test_header_bytes() {
        assert_eq!(FrameHeader::Rekey.as_byte(), 0);
        assert_eq!(FrameHeader::Data.as_byte(), 1);
        assert_eq!(FrameHeader::try_from(0).ok(), Some(FrameHeader::Rekey));
        assert_eq!(FrameHeader::try_from(1).ok(), Some(FrameHeader::Data));
        assert!(matches!(
            FrameHeader::try_from(2),
            Err(ProtocolError::UnknownHeaderReceived(2))
        ));
    }

    #[test]
    fn test_body_len() {
        assert_eq!(Frame::Rekey.body_len(), 0);
        assert_eq!(Frame::Plain(Bytes::from_static(b"ping")).body_len(), 12);
        let sealed = Frame::Sealed {
            nonce: Bytes::from(vec![0u8; 12]),
            ciphertext: Bytes::from(vec![0u8; 20]),
        };
        assert_eq!(sealed.body_len(), 8 + 12 + 8 + 20);
        assert_eq!(sealed.header(), FrameHeader::Data);
    }

    #[test]
    fn test_sealed_body_len_matches_real_frame() {
        let cipher = SessionCipher::derive(b"k", b"m").unwrap();
        for len in [0usize, 1, 100, 4096] {
            let (nonce, ciphertext) = cipher.seal(&vec![0u8; len], b"").unwrap();
            let frame = Frame::Sealed {
                nonce: Bytes::copy_from_slice(&nonce),
                ciphertext: Bytes::from(ciphertext),
            };
            assert_eq!(sealed_body_len(len as u64), frame.body_len());
        }
    }
}
