//! Secure connection over an arbitrary async byte stream.
//!
//! [`Connection::upgrade`] wraps a stream that both peers already opened and
//! runs the first handshake before returning. After that, every data frame is
//! sealed with the session cipher and the session is renegotiated in-band once
//! the byte thresholds of [`SessionConfig`] are crossed.
//!
//! ## Locking
//! The write half and the read half each sit behind an async mutex. A rekey
//! needs both, and always takes them writer first. A receive that has to
//! rekey releases the reader, takes both in order, and skips the rekey if
//! another task finished one in the meantime.

use crate::config::SessionConfig;
use crate::core::codec::{FrameReader, FrameWriter};
use crate::core::packet::{sealed_body_len, FrameHeader};
use crate::error::{ProtocolError, Result};
use crate::protocol::rekey::{Handshake, RekeyEvent, RekeyTrigger, Role};
use crate::protocol::state::SessionState;
use crate::utils::crypto::SessionCipher;
use crate::utils::metrics::{Metrics, Timer};
use std::fmt;
use std::sync::Arc;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// Called right before a rekey attempt starts
pub type PreRekeyHook = Arc<dyn Fn(&RekeyEvent) + Send + Sync>;

/// Called after a rekey attempt finished, with its error if it failed
pub type PostRekeyHook = Arc<dyn Fn(&RekeyEvent, Option<&ProtocolError>) + Send + Sync>;

#[derive(Clone, Default)]
struct RekeyHooks {
    pre: Option<PreRekeyHook>,
    post: Option<PostRekeyHook>,
}

impl RekeyHooks {
    fn pre(&self, event: &RekeyEvent) {
        if let Some(hook) = &self.pre {
            hook(event);
        }
    }

    fn post(&self, event: &RekeyEvent, error: Option<&ProtocolError>) {
        if let Some(hook) = &self.post {
            hook(event, error);
        }
    }
}

/// Options for [`Connection`] before the stream is upgraded
pub struct ConnectionBuilder {
    base_key: Zeroizing<Vec<u8>>,
    is_server: bool,
    config: SessionConfig,
    hooks: RekeyHooks,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionBuilder {
    pub fn new(base_key: impl AsRef<[u8]>) -> Self {
        Self {
            base_key: Zeroizing::new(base_key.as_ref().to_vec()),
            is_server: false,
            config: SessionConfig::default(),
            hooks: RekeyHooks::default(),
            metrics: None,
        }
    }

    /// The server side runs the initiator half of every handshake
    pub fn server(mut self, is_server: bool) -> Self {
        self.is_server = is_server;
        self
    }

    /// Session limits; must match the peer's
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_pre_rekey<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RekeyEvent) + Send + Sync + 'static,
    {
        self.hooks.pre = Some(Arc::new(hook));
        self
    }

    pub fn on_post_rekey<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RekeyEvent, Option<&ProtocolError>) + Send + Sync + 'static,
    {
        self.hooks.post = Some(Arc::new(hook));
        self
    }

    /// Share a metrics collector between connections
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wrap `stream` and run the initial handshake.
    ///
    /// On error the stream is dropped.
    pub async fn upgrade<S>(self, stream: S) -> Result<Connection<S>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.config.validate_strict()?;
        if self.base_key.is_empty() {
            return Err(ProtocolError::ConfigError(
                "Base key cannot be empty".to_string(),
            ));
        }

        let (read_half, write_half) = split(stream);
        let max_packet = self.config.max_packet_length;
        let connection = Connection {
            writer: Mutex::new(FrameWriter::new(write_half, max_packet)),
            reader: Mutex::new(FrameReader::new(read_half, max_packet)),
            receive_gate: Mutex::new(()),
            state: SessionState::new(&self.config),
            base_key: self.base_key,
            role: Role::from_server_flag(self.is_server),
            config: self.config,
            hooks: self.hooks,
            metrics: self.metrics.unwrap_or_default(),
        };

        connection.rekey_with(RekeyTrigger::Initial).await?;
        Ok(connection)
    }
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("is_server", &self.is_server)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Encrypted, self-rekeying connection.
///
/// All methods take `&self`; one task may send while another receives.
pub struct Connection<S> {
    writer: Mutex<FrameWriter<WriteHalf<S>>>,
    reader: Mutex<FrameReader<ReadHalf<S>>>,
    receive_gate: Mutex<()>,
    state: SessionState,
    base_key: Zeroizing<Vec<u8>>,
    role: Role,
    config: SessionConfig,
    hooks: RekeyHooks,
    metrics: Arc<Metrics>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Upgrade with default limits and no hooks
    pub async fn upgrade(stream: S, is_server: bool, base_key: impl AsRef<[u8]>) -> Result<Self> {
        ConnectionBuilder::new(base_key)
            .server(is_server)
            .upgrade(stream)
            .await
    }

    pub fn builder(base_key: impl AsRef<[u8]>) -> ConnectionBuilder {
        ConnectionBuilder::new(base_key)
    }

    /// Seal and send one payload
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.send_with_aad(payload, &[]).await
    }

    /// Seal and send one payload bound to `aad`, which the peer must pass to
    /// [`receive_with_aad`](Self::receive_with_aad).
    #[instrument(skip(self, payload, aad), fields(role = %self.role, len = payload.len()), level = "debug")]
    pub async fn send_with_aad(&self, payload: &[u8], aad: &[u8]) -> Result<()> {
        let result = self.send_inner(payload, aad).await;
        if let Err(e) = &result {
            self.metrics.protocol_error(e);
        }
        result
    }

    async fn send_inner(&self, payload: &[u8], aad: &[u8]) -> Result<()> {
        let len = payload.len() as u64;
        let counted = sealed_body_len(len);
        // Would not fit under a fresh key either
        if len >= self.config.max_packet_length
            || counted > self.config.max_packet_length
            || counted >= self.config.reject_after_bytes
        {
            return Err(ProtocolError::TooLargePacket(len));
        }

        let mut writer = self.writer.lock().await;
        let budget = self.state.budget();

        if budget.used().saturating_add(counted) >= self.config.reject_after_bytes {
            debug!(used = budget.used(), counted, "Hard ceiling reached, rekeying before send");
            let mut reader = self.reader.lock().await;
            self.rekey_locked(&mut writer, &mut reader, RekeyTrigger::Threshold)
                .await?;
        }

        let cipher = self
            .state
            .cipher()?
            .ok_or(ProtocolError::SessionNotEstablished)?;
        writer
            .send_frame(FrameHeader::Data, payload, Some(cipher.as_ref()), aad)
            .await?;
        let used = budget.record(counted)?;
        self.metrics.packet_sent(len);

        if used >= self.config.rekey_after_bytes {
            debug!(used, "Rekey threshold reached after send");
            let mut reader = self.reader.lock().await;
            self.rekey_locked(&mut writer, &mut reader, RekeyTrigger::Threshold)
                .await?;
        }

        Ok(())
    }

    /// Receive and open the next application payload.
    ///
    /// Rekey requests from the peer are answered transparently. When the
    /// payload crosses the rekey threshold, the rekey runs before it is
    /// returned. A failed rekey at that point does not discard the payload:
    /// the failure goes to the post-rekey hook and the metrics, and the next
    /// call fails with `SessionNotEstablished`.
    pub async fn receive(&self) -> Result<Vec<u8>> {
        self.receive_with_aad(&[]).await
    }

    #[instrument(skip(self, aad), fields(role = %self.role), level = "debug")]
    pub async fn receive_with_aad(&self, aad: &[u8]) -> Result<Vec<u8>> {
        let result = self.receive_inner(aad).await;
        if let Err(e) = &result {
            self.metrics.protocol_error(e);
        }
        result
    }

    async fn receive_inner(&self, aad: &[u8]) -> Result<Vec<u8>> {
        let _gate = self.receive_gate.lock().await;
        let mut answered_rekey = false;

        loop {
            let mut reader = self.reader.lock().await;
            let cipher = self.state.cipher()?;
            let (header, payload) = reader
                .receive_frame(cipher.as_deref(), aad, self.state.budget())
                .await?;

            match header {
                FrameHeader::Rekey => {
                    if answered_rekey {
                        return Err(ProtocolError::RecursiveRekey);
                    }
                    answered_rekey = true;
                    let epoch = self.state.epoch();
                    drop(reader);
                    self.rekey_after_receive(RekeyTrigger::Peer, epoch).await?;
                }
                FrameHeader::Data => {
                    if cipher.is_none() {
                        return Err(ProtocolError::SessionNotEstablished);
                    }
                    self.metrics.packet_received(payload.len() as u64);

                    if self.state.budget().used() >= self.config.rekey_after_bytes {
                        debug!(used = self.state.budget().used(), "Rekey threshold reached after receive");
                        let epoch = self.state.epoch();
                        drop(reader);
                        if let Err(e) = self
                            .rekey_after_receive(RekeyTrigger::Threshold, epoch)
                            .await
                        {
                            debug!(error = %e, "Delivering payload despite failed rekey");
                        }
                    }
                    return Ok(payload);
                }
            }
        }
    }

    async fn rekey_after_receive(&self, trigger: RekeyTrigger, seen_epoch: u64) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        if self.state.epoch() != seen_epoch {
            debug!(%trigger, seen_epoch, "Rekey already ran on another task");
            return Ok(());
        }
        self.rekey_locked(&mut writer, &mut reader, trigger).await
    }

    /// Renegotiate the session key now.
    ///
    /// The peer must be reading (or sending) for the handshake to complete.
    #[instrument(skip(self), fields(role = %self.role), level = "debug")]
    pub async fn rekey(&self) -> Result<()> {
        self.rekey_with(RekeyTrigger::Manual).await
    }

    async fn rekey_with(&self, trigger: RekeyTrigger) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        self.rekey_locked(&mut writer, &mut reader, trigger).await
    }

    async fn rekey_locked(
        &self,
        writer: &mut FrameWriter<WriteHalf<S>>,
        reader: &mut FrameReader<ReadHalf<S>>,
        trigger: RekeyTrigger,
    ) -> Result<()> {
        let epoch = self.state.begin_epoch()?;
        let event = RekeyEvent {
            role: self.role,
            trigger,
            epoch,
        };

        self.hooks.pre(&event);
        self.metrics.rekey_attempt();
        let timer = Timer::start("rekey");

        let result = match self.run_handshake(writer, reader, trigger).await {
            Ok(cipher) => self.state.install(cipher),
            Err(e) => {
                if let Err(clear_err) = self.state.clear() {
                    warn!(error = %clear_err, "Could not clear session after failed rekey");
                }
                Err(e)
            }
        };
        drop(timer);

        match &result {
            Ok(()) => {
                self.metrics.rekey_success();
                info!(role = %self.role, %trigger, epoch, "Session key established");
            }
            Err(e) => {
                self.metrics.rekey_failed(e);
                warn!(role = %self.role, %trigger, epoch, error = %e, "Rekey failed");
            }
        }

        self.hooks.post(&event, result.as_ref().err());
        result
    }

    async fn run_handshake(
        &self,
        writer: &mut FrameWriter<WriteHalf<S>>,
        reader: &mut FrameReader<ReadHalf<S>>,
        trigger: RekeyTrigger,
    ) -> Result<SessionCipher> {
        self.state.clear()?;
        if trigger.is_self_initiated() {
            writer.send_rekey().await?;
        }
        Handshake::new(self.role, &self.base_key[..], self.state.budget())
            .tolerate_crossing_signal(trigger.is_self_initiated())
            .run(reader, writer)
            .await
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role.is_server()
    }

    /// Whether a verified session key is active
    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    /// Bytes sent plus bytes received under the current key
    pub fn bytes_since_rekey(&self) -> u64 {
        self.state.budget().used()
    }

    /// Number of rekey attempts so far, the initial handshake included
    pub fn epoch(&self) -> u64 {
        self.state.epoch()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    #[doc(hidden)]
    pub fn set_bytes_since_rekey(&self, bytes: u64) -> Result<()> {
        self.state.budget().set(bytes)
    }

    /// Give back the underlying stream.
    ///
    /// Bytes already read from the stream but not yet consumed are lost.
    pub fn into_inner(self) -> S {
        let read_half = self.reader.into_inner().into_inner();
        let write_half = self.writer.into_inner().into_inner();
        read_half.unsplit(write_half)
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("epoch", &self.state.epoch())
            .field("established", &self.state.is_established())
            .field("bytes_since_rekey", &self.state.budget().used())
            .finish_non_exhaustive()
    }
}
