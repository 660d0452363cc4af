//! Session channel: the duplex link to the remote conversational engine.

pub mod channel;
pub mod loopback;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use channel::{ChannelConfig, SessionChannel, SessionEvent, SessionSender, SessionState};
pub use loopback::{LoopbackConnector, RemoteEnd};
pub use protocol::{ClientMessage, ServerMessage, SetupMessage};
pub use transport::{Connector, TransportRx, TransportTx};
pub use websocket::WebSocketConnector;
