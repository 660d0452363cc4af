//! Transport seam between the session channel and the network.
//!
//! A `Connector` opens one duplex connection and splits it into a writing
//! half and a reading half. Every transport error is a `ChannelFault`.

use crate::error::Result;
use async_trait::async_trait;

/// Sending half of a connection.
#[async_trait]
pub trait TransportTx: Send {
    /// Send one text frame.
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the connection from our side.
    async fn close(&mut self) -> Result<()>;
}

/// Receiving half of a connection.
#[async_trait]
pub trait TransportRx: Send {
    /// Next text frame.
    ///
    /// `None` once the remote has closed the connection cleanly.
    async fn next_frame(&mut self) -> Option<Result<String>>;
}

/// Opens connections to the remote engine.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn TransportTx>, Box<dyn TransportRx>)>;
}
