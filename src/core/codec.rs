//! Raw packet codec.
//!
//! [`FrameCodec`] is the bit-exact `tokio-util` codec for one frame.
//! [`FrameReader`] and [`FrameWriter`] wrap the two halves of the stream and
//! apply the session cipher on top of it: sealing on the way out, charging the
//! byte budget and opening on the way in.

use crate::core::budget::ByteBudget;
use crate::core::packet::{Frame, FrameHeader, LENGTH_PREFIX_LEN, MAX_PLAIN_BODY};
use crate::error::{ProtocolError, Result};
use crate::utils::crypto::SessionCipher;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::trace;

/// Frame codec.
///
/// Decoding depends on whether a session cipher is active (`sealed`), which
/// the owner flips between frames. Declared lengths are validated before the
/// body is buffered, so a peer cannot make us allocate past the budget. Plain
/// frames are capped at the size of the key material.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    sealed: bool,
    remaining: u64,
    max_packet: u64,
}

impl FrameCodec {
    pub fn new(max_packet: u64) -> Self {
        Self {
            sealed: false,
            remaining: max_packet,
            max_packet,
        }
    }

    /// Expect `nonce + ciphertext` data frames instead of plain ones
    pub fn set_sealed(&mut self, sealed: bool) {
        self.sealed = sealed;
    }

    /// Budget left under the current key; only enforced for sealed frames
    pub fn set_remaining(&mut self, remaining: u64) {
        self.remaining = remaining;
    }

    fn check_declared(&self, counted: u64) -> Result<()> {
        let over_limit = if self.sealed {
            counted >= self.remaining
        } else {
            counted > MAX_PLAIN_BODY
        };
        if counted > self.max_packet || over_limit {
            return Err(ProtocolError::TooLargePacket(counted));
        }
        Ok(())
    }
}

#[inline]
fn read_len(src: &[u8], at: usize) -> Option<u64> {
    let bytes = src.get(at..at + LENGTH_PREFIX_LEN)?;
    let mut buf = [0u8; LENGTH_PREFIX_LEN];
    buf.copy_from_slice(bytes);
    Some(u64::from_le_bytes(buf))
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        if FrameHeader::try_from(first)? == FrameHeader::Rekey {
            src.advance(1);
            return Ok(Some(Frame::Rekey));
        }

        let sections = if self.sealed { 2 } else { 1 };
        let mut lens = [0usize; 2];
        let mut offset = 1usize;
        let mut counted = 0u64;

        for len_slot in lens.iter_mut().take(sections) {
            let Some(len) = read_len(src, offset) else {
                src.reserve(offset + LENGTH_PREFIX_LEN - src.len());
                return Ok(None);
            };
            counted = len
                .checked_add(LENGTH_PREFIX_LEN as u64)
                .and_then(|section| counted.checked_add(section))
                .ok_or(ProtocolError::TooLargePacket(len))?;
            self.check_declared(counted)?;

            *len_slot = usize::try_from(len).map_err(|_| ProtocolError::TooLargePacket(len))?;
            offset += LENGTH_PREFIX_LEN + *len_slot;
        }

        if src.len() < offset {
            src.reserve(offset - src.len());
            return Ok(None);
        }

        src.advance(1 + LENGTH_PREFIX_LEN);
        let first_section = src.split_to(lens[0]).freeze();
        let frame = if self.sealed {
            src.advance(LENGTH_PREFIX_LEN);
            Frame::Sealed {
                nonce: first_section,
                ciphertext: src.split_to(lens[1]).freeze(),
            }
        } else {
            Frame::Plain(first_section)
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(1 + frame.body_len() as usize);
        dst.put_u8(frame.header().as_byte());
        match frame {
            Frame::Rekey => {}
            Frame::Plain(payload) => {
                dst.put_u64_le(payload.len() as u64);
                dst.extend_from_slice(&payload);
            }
            Frame::Sealed { nonce, ciphertext } => {
                dst.put_u64_le(nonce.len() as u64);
                dst.extend_from_slice(&nonce);
                dst.put_u64_le(ciphertext.len() as u64);
                dst.extend_from_slice(&ciphertext);
            }
        }
        Ok(())
    }
}

/// Read half of a framed stream
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, max_packet: u64) -> Self {
        Self {
            inner: FramedRead::new(io, FrameCodec::new(max_packet)),
        }
    }

    /// Next raw frame, decoded in sealed or plain mode.
    ///
    /// A clean EOF between frames is reported as `ConnectionClosed`.
    pub async fn next_frame(&mut self, sealed: bool, remaining: u64) -> Result<Frame> {
        let codec = self.inner.decoder_mut();
        codec.set_sealed(sealed);
        codec.set_remaining(remaining);
        self.inner
            .next()
            .await
            .ok_or(ProtocolError::ConnectionClosed)?
    }

    /// Receive one frame and open it with `cipher`, if any.
    ///
    /// Sealed frames are charged against `budget` before the tag is checked.
    pub async fn receive_frame(
        &mut self,
        cipher: Option<&SessionCipher>,
        aad: &[u8],
        budget: &ByteBudget,
    ) -> Result<(FrameHeader, Vec<u8>)> {
        let frame = self.next_frame(cipher.is_some(), budget.remaining()).await?;
        trace!(header = %frame.header(), body_len = frame.body_len(), "Frame received");

        match frame {
            Frame::Rekey => Ok((FrameHeader::Rekey, Vec::new())),
            Frame::Plain(payload) => Ok((FrameHeader::Data, payload.to_vec())),
            Frame::Sealed { nonce, ciphertext } => {
                budget.charge((2 * LENGTH_PREFIX_LEN + nonce.len() + ciphertext.len()) as u64)?;
                let cipher = cipher.ok_or(ProtocolError::SessionNotEstablished)?;
                let plaintext = cipher.open(&nonce, &ciphertext, aad)?;
                Ok((FrameHeader::Data, plaintext))
            }
        }
    }

    /// Receive a frame that must be a data frame
    pub async fn receive_data(
        &mut self,
        cipher: Option<&SessionCipher>,
        aad: &[u8],
        budget: &ByteBudget,
    ) -> Result<Vec<u8>> {
        match self.receive_frame(cipher, aad, budget).await? {
            (FrameHeader::Data, payload) => Ok(payload),
            (received, _) => Err(ProtocolError::WrongHeaderReceived {
                expected: FrameHeader::Data,
                received,
            }),
        }
    }

    /// Bytes buffered but not yet decoded are discarded.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

/// Write half of a framed stream
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: FramedWrite<W, FrameCodec>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, max_packet: u64) -> Self {
        Self {
            inner: FramedWrite::new(io, FrameCodec::new(max_packet)),
        }
    }

    /// Write one frame and flush it.
    ///
    /// Data frames are sealed with a fresh nonce when `cipher` is set and sent
    /// as plain length-prefixed payloads otherwise.
    pub async fn send_frame(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        cipher: Option<&SessionCipher>,
        aad: &[u8],
    ) -> Result<()> {
        let frame = match (header, cipher) {
            (FrameHeader::Rekey, _) => Frame::Rekey,
            (FrameHeader::Data, None) => Frame::Plain(Bytes::copy_from_slice(payload)),
            (FrameHeader::Data, Some(cipher)) => {
                let (nonce, ciphertext) = cipher.seal(payload, aad)?;
                Frame::Sealed {
                    nonce: Bytes::copy_from_slice(&nonce),
                    ciphertext: Bytes::from(ciphertext),
                }
            }
        };
        trace!(header = %header, body_len = frame.body_len(), "Sending frame");
        self.inner.send(frame).await
    }

    pub async fn send_rekey(&mut self) -> Result<()> {
        self.send_frame(FrameHeader::Rekey, &[], None, &[]).await
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}
