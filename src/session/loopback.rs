//! In-process remote engine for tests and offline runs.
//!
//! `LoopbackConnector` hands the session channel one end of a pair of
//! unbounded queues; `RemoteEnd` holds the other and plays the remote: it reads
//! what the client sent and injects frames, faults and closes.

use crate::error::{ParleyError, Result};
use crate::session::protocol::{ClientMessage, ServerMessage};
use crate::session::transport::{Connector, TransportRx, TransportTx};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

type Frame = Result<String>;

#[derive(Default)]
struct Link {
    to_client: Option<mpsc::UnboundedSender<Frame>>,
    from_client: Option<mpsc::UnboundedReceiver<String>>,
    client_closed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Hub {
    link: Mutex<Link>,
    connections: AtomicUsize,
}

impl Hub {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Connector whose remote is a `RemoteEnd` in the same process.
pub struct LoopbackConnector {
    hub: Arc<Hub>,
    auto_ack: bool,
    refuse: Option<String>,
}

impl LoopbackConnector {
    /// A connector that acknowledges setup immediately, and its remote.
    pub fn new() -> (Self, RemoteEnd) {
        let hub = Arc::new(Hub::default());
        (
            Self {
                hub: Arc::clone(&hub),
                auto_ack: true,
                refuse: None,
            },
            RemoteEnd { hub, inbox: None },
        )
    }

    /// Leave the setup unacknowledged; the test sends `SetupComplete` itself.
    pub fn without_auto_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    /// Fail every connection attempt with `message`.
    pub fn refusing(mut self, message: &str) -> Self {
        self.refuse = Some(message.to_string());
        self
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>)> {
        if let Some(message) = &self.refuse {
            return Err(ParleyError::fault(message.clone()));
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let client_closed = Arc::new(AtomicBool::new(false));

        if self.auto_ack {
            let ack = ServerMessage::SetupComplete.to_json()?;
            if to_client.send(Ok(ack)).is_err() {
                return Err(ParleyError::fault("loopback remote gone"));
            }
        }

        // Replacing the link drops the previous connection's remote half.
        *self.hub.link() = Link {
            to_client: Some(to_client),
            from_client: Some(from_client),
            client_closed: Arc::clone(&client_closed),
        };
        self.hub.connections.fetch_add(1, Ordering::SeqCst);

        Ok((
            Box::new(LoopbackTx {
                tx: Some(client_tx),
                closed: client_closed,
            }),
            Box::new(LoopbackRx { rx: client_rx }),
        ))
    }
}

struct LoopbackTx {
    tx: Option<mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportTx for LoopbackTx {
    async fn send_text(&mut self, text: String) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(text)
                .map_err(|_| ParleyError::fault("loopback remote gone")),
            None => Err(ParleyError::fault("loopback transport closed")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.take();
        Ok(())
    }
}

struct LoopbackRx {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl TransportRx for LoopbackRx {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

/// The remote side of the most recent loopback connection.
pub struct RemoteEnd {
    hub: Arc<Hub>,
    inbox: Option<mpsc::UnboundedReceiver<String>>,
}

impl RemoteEnd {
    fn inject(&self, frame: Frame) {
        let link = self.hub.link();
        match &link.to_client {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    tracing::debug!("loopback client gone, frame dropped");
                }
            }
            None => tracing::debug!("no loopback connection, frame dropped"),
        }
    }

    /// Send a message to the client.
    pub fn push(&self, message: ServerMessage) {
        match message.to_json() {
            Ok(text) => self.inject(Ok(text)),
            Err(e) => tracing::warn!(error = %e, "could not serialize loopback message"),
        }
    }

    /// Send an arbitrary text frame, valid or not.
    pub fn push_raw(&self, text: &str) {
        self.inject(Ok(text.to_string()));
    }

    /// Fail the transport with `message`.
    pub fn fault(&self, message: &str) {
        self.inject(Err(ParleyError::fault(message)));
    }

    /// Close the connection from the remote side.
    pub fn close(&self) {
        self.hub.link().to_client.take();
    }

    /// Connections opened so far.
    pub fn connections(&self) -> usize {
        self.hub.connections.load(Ordering::SeqCst)
    }

    /// Whether the client closed the current connection.
    pub fn was_closed_by_client(&self) -> bool {
        self.hub.link().client_closed.load(Ordering::SeqCst)
    }

    fn refresh_inbox(&mut self) {
        if let Some(inbox) = self.hub.link().from_client.take() {
            self.inbox = Some(inbox);
        }
    }

    /// Next message the client sent on the current connection.
    ///
    /// `None` once the client has closed it. Unparsable frames are skipped.
    pub async fn next_message(&mut self) -> Option<ClientMessage> {
        self.refresh_inbox();
        let inbox = self.inbox.as_mut()?;
        while let Some(text) = inbox.recv().await {
            match serde_json::from_str(&text) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!(error = %e, "loopback received unparsable frame"),
            }
        }
        None
    }

    /// Next audio payload the client sent, skipping other messages.
    pub async fn next_audio(&mut self) -> Option<crate::codec::WirePayload> {
        loop {
            match self.next_message().await? {
                ClientMessage::Audio(payload) => return Some(payload),
                ClientMessage::Setup(_) => continue,
            }
        }
    }
}
