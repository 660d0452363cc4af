//! Duplex engine: capture uplink, inbound dispatch and the lifecycle around them.

pub mod controller;
pub(crate) mod dispatch;
pub mod session;
pub mod uplink;

pub use controller::VoiceEngine;
pub use session::Session;
pub use uplink::EncoderStation;

use crate::error::ParleyError;
use crate::session::channel::SessionState;
use uuid::Uuid;

/// Notifications from a running session.
///
/// Called from the engine's tasks; implementations must not block.
pub trait EngineCallbacks: Send + Sync {
    /// Accumulated transcript text for the current turn.
    fn on_message(&self, text: &str, is_user: bool);

    /// The session failed and has been torn down.
    fn on_error(&self, error: &ParleyError);

    /// The remote ended the session.
    fn on_close(&self);
}

/// Point-in-time counters of the running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub frames_sent: u64,
    /// Frames lost to a full capture queue or a full outbound queue.
    pub frames_dropped: u64,
    pub segments_active: usize,
    pub segments_scheduled: u64,
    /// Segments the output device refused.
    pub segments_rejected: u64,
    /// Barge-ins that cut playback short.
    pub interrupts: u64,
    /// Capture frames the uplink encoded and handed to the session.
    pub frames_encoded: u64,
    /// Inbound payloads that could not be parsed or decoded.
    pub payloads_dropped: u64,
}
