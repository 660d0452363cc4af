//! Session channel: one duplex conversation with the remote engine.
//!
//! Lifecycle is `Idle -> Connecting -> Open -> Closing -> Closed`, with
//! `Error` as a terminal side state for transport faults. Outbound messages
//! go through a bounded FIFO drained by a writer task; inbound frames are
//! parsed by a reader task and delivered as `SessionEvent`s in arrival order.

use crate::codec::WirePayload;
use crate::config::SessionConfig;
use crate::error::{ParleyError, Result};
use crate::session::protocol::{ClientMessage, ServerMessage, SetupMessage};
use crate::session::transport::{Connector, TransportRx, TransportTx};
use crate::transcript::Direction;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use uuid::Uuid;

/// Time allowed for the writer to flush and close the transport.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    /// No further events will be delivered.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Inbound notification, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    Audio(WirePayload),
    Transcript { direction: Direction, text: String },
    TurnComplete,
    Interrupted,
    /// Transport fault or remote error. Always the last event.
    Fault(ParleyError),
    /// The remote closed the session. Always the last event.
    Closed,
}

/// Channel settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub setup: SetupMessage,
    pub connect_timeout: Duration,
    pub outbound_queue: usize,
    pub event_queue: usize,
}

impl From<&SessionConfig> for ChannelConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            setup: SetupMessage::from(config),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            outbound_queue: config.outbound_queue.max(1),
            event_queue: config.event_queue.max(1),
        }
    }
}

/// State shared between the channel handle and its tasks.
struct Shared {
    id: Uuid,
    state: Mutex<SessionState>,
    sent: AtomicU64,
    dropped_sends: AtomicU64,
    malformed: AtomicU64,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if !from.contains(&state) {
            return false;
        }
        let previous = *state;
        tracing::debug!(session = %self.id, from = %previous, to = %to, "session state");
        *state = to;
        true
    }

    /// Enter `Error` unless the session is already ending. Only one caller wins.
    fn fail(&self) -> bool {
        self.transition(&[SessionState::Connecting, SessionState::Open], SessionState::Error)
    }
}

enum Outbound {
    Message(ClientMessage),
    Close,
}

/// Cloneable, non-blocking handle for queueing outbound audio.
///
/// Usable from plain threads.
#[derive(Clone)]
pub struct SessionSender {
    outbound: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
}

impl SessionSender {
    /// Queue a payload without waiting.
    ///
    /// A full queue drops the payload (counted) so capture never stalls.
    ///
    /// # Errors
    /// `ParleyError::ChannelFault` if the session is no longer open.
    pub fn send(&self, payload: WirePayload) -> Result<()> {
        if self.shared.state() != SessionState::Open {
            return Err(ParleyError::fault("session is not open"));
        }
        match self.outbound.try_send(Outbound::Message(ClientMessage::Audio(payload))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.shared.dropped_sends.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 50 == 0 {
                    tracing::warn!(dropped, "outbound queue full, dropping audio");
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ParleyError::fault("session writer has stopped"))
            }
        }
    }
}

/// One duplex session with the remote engine.
pub struct SessionChannel {
    config: ChannelConfig,
    shared: Arc<Shared>,
    outbound: Option<mpsc::Sender<Outbound>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl SessionChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                state: Mutex::new(SessionState::Idle),
                sent: AtomicU64::new(0),
                dropped_sends: AtomicU64::new(0),
                malformed: AtomicU64::new(0),
            }),
            outbound: None,
            writer: None,
            reader: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Payloads handed to the transport.
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Payloads discarded because the outbound queue was full.
    pub fn dropped_sends(&self) -> u64 {
        self.shared.dropped_sends.load(Ordering::Relaxed)
    }

    /// Inbound frames discarded because they could not be parsed.
    pub fn malformed_frames(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    /// Open the connection, send the setup record and wait for the remote's
    /// acknowledgement.
    ///
    /// Returns the inbound event stream.
    ///
    /// # Errors
    /// `ParleyError::ChannelFault` if the transport fails, the remote rejects
    /// the setup, or no acknowledgement arrives within the connect timeout.
    pub async fn connect(
        &mut self,
        connector: &dyn Connector,
    ) -> Result<mpsc::Receiver<SessionEvent>> {
        if !self
            .shared
            .transition(&[SessionState::Idle], SessionState::Connecting)
        {
            return Err(ParleyError::fault(format!(
                "cannot connect a session in state {}",
                self.state()
            )));
        }

        let deadline = Instant::now() + self.config.connect_timeout;
        let handshake = async {
            let (mut tx, mut rx) = connector.connect().await?;
            let setup = ClientMessage::Setup(self.config.setup.clone()).to_json()?;
            tx.send_text(setup).await?;
            self.await_setup_complete(rx.as_mut()).await?;
            Ok::<_, ParleyError>((tx, rx))
        };

        let (tx, rx) = match tokio::time::timeout_at(deadline, handshake).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                self.shared.fail();
                return Err(match e {
                    ParleyError::ChannelFault { .. } => e,
                    other => ParleyError::fault(other.to_string()),
                });
            }
            Err(_) => {
                self.shared.fail();
                return Err(ParleyError::fault(format!(
                    "no setup acknowledgement within {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_queue);

        self.shared
            .transition(&[SessionState::Connecting], SessionState::Open);
        tracing::info!(session = %self.shared.id, "session open");

        // The reader owns the only strong event sender, so the stream ends
        // with it.
        self.writer = Some(tokio::spawn(write_loop(
            tx,
            outbound_rx,
            event_tx.downgrade(),
            Arc::clone(&self.shared),
        )));
        self.reader = Some(tokio::spawn(read_loop(
            rx,
            event_tx,
            Arc::clone(&self.shared),
        )));
        self.outbound = Some(outbound_tx);

        Ok(event_rx)
    }

    async fn await_setup_complete(&self, rx: &mut dyn TransportRx) -> Result<()> {
        loop {
            let text = match rx.next_frame().await {
                Some(frame) => frame?,
                None => return Err(ParleyError::fault("remote closed during setup")),
            };
            match ServerMessage::from_json(&text) {
                Ok(ServerMessage::SetupComplete) => return Ok(()),
                Ok(ServerMessage::Error { message }) => {
                    return Err(ParleyError::fault(format!("setup rejected: {}", message)));
                }
                Ok(other) => {
                    tracing::debug!(message = ?other, "ignoring message before setup completed");
                }
                Err(e) => {
                    self.shared.malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "dropping malformed frame during setup");
                }
            }
        }
    }

    /// Non-blocking handle for outbound audio.
    ///
    /// # Errors
    /// `ParleyError::ChannelFault` if the session was never opened.
    pub fn sender(&self) -> Result<SessionSender> {
        let outbound = self
            .outbound
            .clone()
            .ok_or_else(|| ParleyError::fault("session is not open"))?;
        Ok(SessionSender {
            outbound,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Queue a payload for transmission (fire-and-forget, FIFO).
    ///
    /// # Errors
    /// `ParleyError::ChannelFault` if the session is not open.
    pub fn send(&self, payload: WirePayload) -> Result<()> {
        self.sender()?.send(payload)
    }

    /// Close the session. Safe to call from any state, any number of times.
    pub async fn close(&mut self) {
        if self
            .shared
            .transition(&[SessionState::Idle], SessionState::Closed)
        {
            return;
        }
        self.shared
            .transition(&[SessionState::Connecting, SessionState::Open], SessionState::Closing);

        if let Some(outbound) = self.outbound.take() {
            // Full queue: the writer is aborted below instead.
            if outbound.try_send(Outbound::Close).is_err() {
                tracing::debug!(session = %self.shared.id, "could not queue close");
            }
        }

        if let Some(mut writer) = self.writer.take()
            && timeout(CLOSE_GRACE, &mut writer).await.is_err()
        {
            writer.abort();
            tracing::debug!(session = %self.shared.id, "writer did not finish, aborted");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
            // Cancelled or finished; either way the task is gone.
            if let Err(e) = reader.await
                && !e.is_cancelled()
            {
                tracing::warn!(error = %e, "session reader task failed");
            }
        }

        self.shared
            .transition(&[SessionState::Closing], SessionState::Closed);
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn write_loop(
    mut tx: Box<dyn TransportTx>,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::WeakSender<SessionEvent>,
    shared: Arc<Shared>,
) {
    while let Some(item) = outbound.recv().await {
        let message = match item {
            Outbound::Message(message) => message,
            Outbound::Close => break,
        };
        let result = match message.to_json() {
            Ok(text) => tx.send_text(text).await,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unserializable outbound message");
                continue;
            }
        };
        match result {
            Ok(()) => {
                shared.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if shared.fail() {
                    tracing::error!(session = %shared.id, error = %e, "session send failed");
                    if let Some(events) = events.upgrade()
                        && events.send(SessionEvent::Fault(e)).await.is_err()
                    {
                        tracing::debug!("event receiver gone");
                    }
                }
                return;
            }
        }
    }

    if let Err(e) = tx.close().await {
        tracing::debug!(error = %e, "transport close failed");
    }
}

async fn read_loop(
    mut rx: Box<dyn TransportRx>,
    events: mpsc::Sender<SessionEvent>,
    shared: Arc<Shared>,
) {
    loop {
        let text = match rx.next_frame().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                if shared.fail() {
                    tracing::error!(session = %shared.id, error = %e, "session transport fault");
                    if events.send(SessionEvent::Fault(e)).await.is_err() {
                        tracing::debug!("event receiver gone");
                    }
                }
                return;
            }
            None => {
                if shared.transition(&[SessionState::Open], SessionState::Closing) {
                    tracing::info!(session = %shared.id, "remote closed the session");
                    shared.transition(&[SessionState::Closing], SessionState::Closed);
                    if events.send(SessionEvent::Closed).await.is_err() {
                        tracing::debug!("event receiver gone");
                    }
                }
                return;
            }
        };

        let message = match ServerMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => {
                let malformed = shared.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(error = %e, malformed, "dropping malformed frame");
                continue;
            }
        };

        let event = match message {
            ServerMessage::Audio { data, mime_type } => SessionEvent::Audio(WirePayload {
                mime_type: mime_type.unwrap_or_default(),
                data,
            }),
            ServerMessage::InputTranscription { text } => SessionEvent::Transcript {
                direction: Direction::Input,
                text,
            },
            ServerMessage::OutputTranscription { text } => SessionEvent::Transcript {
                direction: Direction::Output,
                text,
            },
            ServerMessage::TurnComplete => SessionEvent::TurnComplete,
            ServerMessage::Interrupted => SessionEvent::Interrupted,
            ServerMessage::SetupComplete => {
                tracing::debug!("duplicate setup acknowledgement");
                continue;
            }
            ServerMessage::Error { message } => {
                if shared.fail() {
                    tracing::error!(session = %shared.id, error = %message, "remote reported an error");
                    let fault = ParleyError::fault(message);
                    if events.send(SessionEvent::Fault(fault)).await.is_err() {
                        tracing::debug!("event receiver gone");
                    }
                }
                return;
            }
        };

        // A local close is in progress: nothing more is delivered.
        if shared.state() != SessionState::Open {
            return;
        }
        if events.send(event).await.is_err() {
            return;
        }
    }
}
