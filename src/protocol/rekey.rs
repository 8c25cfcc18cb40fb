//! Rekey state machine.
//!
//! A rekey always runs the same three steps: exchange random material,
//! derive the session cipher, verify that both sides derived the same one.
//! The connection's role picks which side of each step it plays:
//!
//! ```text
//! Initiator (server)                     Responder (client)
//!   material ── data, plain ──────────────▶  derive
//!   derive
//!   challenge ── "verify_data" ───────────▶  reverse
//!   compare  ◀── "verify_data_response" ───
//!   result ──── "verify_data_result" ─────▶  check == 1
//! ```
//!
//! The role is fixed per connection. Which side *decided* to rekey only
//! matters for the leading `rekey` signal, which is sent by the connection
//! before the handshake starts.

use crate::config::RANDOM_MATERIAL_LEN;
use crate::core::budget::ByteBudget;
use crate::core::codec::{FrameReader, FrameWriter};
use crate::core::packet::FrameHeader;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{random_material, SessionCipher};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use zeroize::Zeroizing;

/// Associated data for the verification challenge
pub const VERIFY_DATA: &[u8] = b"verify_data";
/// Associated data for the reversed challenge
pub const VERIFY_DATA_RESPONSE: &[u8] = b"verify_data_response";
/// Associated data for the one-byte verdict
pub const VERIFY_DATA_RESULT: &[u8] = b"verify_data_result";

const VERIFY_OK: u8 = 1;
const VERIFY_FAILED: u8 = 0;

/// Which half of the handshake a connection runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Server side: sends the key material and the challenge
    Initiator,
    /// Client side: receives the key material and answers the challenge
    Responder,
}

impl Role {
    pub fn from_server_flag(is_server: bool) -> Self {
        if is_server {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn is_server(self) -> bool {
        self == Role::Initiator
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Why a rekey was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RekeyTrigger {
    /// First handshake right after the stream was upgraded
    Initial,
    /// This side crossed a byte threshold
    Threshold,
    /// The peer sent a `rekey` signal
    Peer,
    /// Requested through [`Connection::rekey`](crate::transport::Connection::rekey)
    Manual,
}

impl RekeyTrigger {
    /// Whether this side signals the peer before the handshake
    pub fn is_self_initiated(self) -> bool {
        matches!(self, RekeyTrigger::Threshold | RekeyTrigger::Manual)
    }
}

impl fmt::Display for RekeyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RekeyTrigger::Initial => "initial",
            RekeyTrigger::Threshold => "threshold",
            RekeyTrigger::Peer => "peer",
            RekeyTrigger::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Passed to the pre/post rekey hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyEvent {
    pub role: Role,
    pub trigger: RekeyTrigger,
    /// Sequence number of this attempt, starting at 1 for the initial handshake
    pub epoch: u64,
}

/// One run of the rekey procedure
pub struct Handshake<'a> {
    role: Role,
    base_key: &'a [u8],
    budget: &'a ByteBudget,
    tolerate_crossing: bool,
}

impl<'a> Handshake<'a> {
    pub fn new(role: Role, base_key: &'a [u8], budget: &'a ByteBudget) -> Self {
        Self {
            role,
            base_key,
            budget,
            tolerate_crossing: false,
        }
    }

    /// Skip one `rekey` frame if it is the first frame read.
    ///
    /// When both sides decide to rekey at the same moment each one receives
    /// the other's signal at the start of its own handshake.
    pub fn tolerate_crossing_signal(mut self, tolerate: bool) -> Self {
        self.tolerate_crossing = tolerate;
        self
    }

    /// Run all three steps and return the verified cipher
    pub async fn run<R, W>(
        mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<SessionCipher>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let material = self.exchange_material(reader, writer).await?;
        let cipher = SessionCipher::derive(self.base_key, &material)?;
        self.verify(&cipher, reader, writer).await?;
        Ok(cipher)
    }

    async fn exchange_material<R, W>(
        &mut self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Zeroizing<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self.role {
            Role::Initiator => {
                let material = random_material(RANDOM_MATERIAL_LEN)?;
                writer
                    .send_frame(FrameHeader::Data, &material, None, &[])
                    .await?;
                Ok(material)
            }
            Role::Responder => {
                let material = Zeroizing::new(self.read_data(reader, None, &[]).await?);
                if material.len() != RANDOM_MATERIAL_LEN {
                    return Err(ProtocolError::HandshakeError(
                        constants::ERR_RANDOM_MATERIAL_LENGTH.into(),
                    ));
                }
                Ok(material)
            }
        }
    }

    async fn verify<R, W>(
        &mut self,
        cipher: &SessionCipher,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self.role {
            Role::Initiator => {
                let challenge = random_material(RANDOM_MATERIAL_LEN)?;
                writer
                    .send_frame(FrameHeader::Data, &challenge, Some(cipher), VERIFY_DATA)
                    .await?;

                let response = Zeroizing::new(
                    self.read_data(reader, Some(cipher), VERIFY_DATA_RESPONSE)
                        .await?,
                );
                let matches = response.len() == challenge.len()
                    && response.iter().eq(challenge.iter().rev());

                if !matches {
                    // The verdict is a courtesy; the failure stands either way
                    if let Err(e) = writer
                        .send_frame(
                            FrameHeader::Data,
                            &[VERIFY_FAILED],
                            Some(cipher),
                            VERIFY_DATA_RESULT,
                        )
                        .await
                    {
                        debug!(error = %e, "Could not deliver negative verification result");
                    }
                    return Err(ProtocolError::VerificationFailed);
                }

                writer
                    .send_frame(
                        FrameHeader::Data,
                        &[VERIFY_OK],
                        Some(cipher),
                        VERIFY_DATA_RESULT,
                    )
                    .await
            }
            Role::Responder => {
                let mut challenge =
                    Zeroizing::new(self.read_data(reader, Some(cipher), VERIFY_DATA).await?);
                challenge.reverse();
                writer
                    .send_frame(
                        FrameHeader::Data,
                        &challenge,
                        Some(cipher),
                        VERIFY_DATA_RESPONSE,
                    )
                    .await?;

                let verdict = self
                    .read_data(reader, Some(cipher), VERIFY_DATA_RESULT)
                    .await?;
                match verdict.as_slice() {
                    [VERIFY_OK] => Ok(()),
                    _ => Err(ProtocolError::VerificationFailed),
                }
            }
        }
    }

    async fn read_data<R>(
        &mut self,
        reader: &mut FrameReader<R>,
        cipher: Option<&SessionCipher>,
        aad: &[u8],
    ) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = reader.receive_frame(cipher, aad, self.budget).await?;
            let tolerate = std::mem::replace(&mut self.tolerate_crossing, false);
            match frame {
                (FrameHeader::Data, payload) => return Ok(payload),
                (FrameHeader::Rekey, _) if tolerate => {
                    debug!(role = %self.role, "Absorbed crossing rekey signal");
                }
                (received, _) => {
                    return Err(ProtocolError::WrongHeaderReceived {
                        expected: FrameHeader::Data,
                        received,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type Reader = FrameReader<ReadHalf<DuplexStream>>;
    type Writer = FrameWriter<WriteHalf<DuplexStream>>;

    fn halves(stream: DuplexStream) -> (Reader, Writer) {
        let (r, w) = split(stream);
        let max = SessionConfig::default().max_packet_length;
        (FrameReader::new(r, max), FrameWriter::new(w, max))
    }

    #[test]
    fn test_role_mapping() {
        assert_eq!(Role::from_server_flag(true), Role::Initiator);
        assert_eq!(Role::from_server_flag(false), Role::Responder);
        assert!(Role::Initiator.is_server());
        assert!(!Role::Responder.is_server());
    }

    #[test]
    fn test_trigger_signalling() {
        assert!(RekeyTrigger::Threshold.is_self_initiated());
        assert!(RekeyTrigger::Manual.is_self_initiated());
        assert!(!RekeyTrigger::Peer.is_self_initiated());
        assert!(!RekeyTrigger::Initial.is_self_initiated());
    }

    #[tokio::test]
    async fn test_both_roles_derive_same_cipher() {
        let (a, b) = duplex(4096);
        let (mut ar, mut aw) = halves(a);
        let (mut br, mut bw) = halves(b);
        let config = SessionConfig::default();
        let budget_a = ByteBudget::new(&config);
        let budget_b = ByteBudget::new(&config);

        let (server, client) = tokio::join!(
            Handshake::new(Role::Initiator, b"shared", &budget_a).run(&mut ar, &mut aw),
            Handshake::new(Role::Responder, b"shared", &budget_b).run(&mut br, &mut bw),
        );
        let server = server.unwrap();
        let client = client.unwrap();

        let (nonce, ciphertext) = server.seal(b"hello", b"").unwrap();
        assert_eq!(client.open(&nonce, &ciphertext, b"").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_crossing_signal_is_absorbed_once() {
        let (a, b) = duplex(4096);
        let (mut ar, mut aw) = halves(a);
        let (mut br, mut bw) = halves(b);
        let config = SessionConfig::default();
        let budget_a = ByteBudget::new(&config);
        let budget_b = ByteBudget::new(&config);

        aw.send_rekey().await.unwrap();
        bw.send_rekey().await.unwrap();

        let (server, client) = tokio::join!(
            Handshake::new(Role::Initiator, b"k", &budget_a)
                .tolerate_crossing_signal(true)
                .run(&mut ar, &mut aw),
            Handshake::new(Role::Responder, b"k", &budget_b)
                .tolerate_crossing_signal(true)
                .run(&mut br, &mut bw),
        );
        assert!(server.is_ok());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_unexpected_signal_is_wrong_header() {
        let (a, b) = duplex(4096);
        let (mut ar, mut aw) = halves(a);
        let (_br, mut bw) = halves(b);
        let budget = ByteBudget::new(&SessionConfig::default());

        bw.send_rekey().await.unwrap();
        let result = Handshake::new(Role::Responder, b"k", &budget)
            .run(&mut ar, &mut aw)
            .await;
        assert!(matches!(
            result,
            Err(ProtocolError::WrongHeaderReceived {
                expected: FrameHeader::Data,
                received: FrameHeader::Rekey,
            })
        ));
    }

    #[tokio::test]
    async fn test_short_material_rejected() {
        let (a, b) = duplex(4096);
        let (mut ar, mut aw) = halves(a);
        let (_br, mut bw) = halves(b);
        let budget = ByteBudget::new(&SessionConfig::default());

        bw.send_frame(FrameHeader::Data, &[0u8; 16], None, &[])
            .await
            .unwrap();
        let result = Handshake::new(Role::Responder, b"k", &budget)
            .run(&mut ar, &mut aw)
            .await;
        assert!(matches!(result, Err(ProtocolError::HandshakeError(_))));
    }
}
