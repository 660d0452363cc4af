//! Uplink station: capture frames in, encoded payloads out to the session.

use crate::audio::framer::AudioFrame;
use crate::codec;
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::session::channel::SessionSender;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Encodes each frame and queues it on the session without waiting.
///
/// A closed session halts the station: it stops and stops pulling frames,
/// so the framer's queue fills and capture drops instead of blocking.
pub struct EncoderStation {
    sender: SessionSender,
    encoded: Arc<AtomicU64>,
}

impl EncoderStation {
    pub fn new(sender: SessionSender) -> Self {
        Self {
            sender,
            encoded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of frames handed to the session.
    pub fn encoded_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.encoded)
    }
}

impl Station for EncoderStation {
    type Input = AudioFrame;
    type Output = ();

    fn process(&mut self, frame: AudioFrame) -> Result<Option<()>, StationError> {
        let payload = codec::encode(&frame);
        self.sender
            .send(payload)
            .map_err(|e| StationError::Halted(e.to_string()))?;
        self.encoded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(sequence = frame.sequence(), level = frame.level(), "frame sent");
        Ok(Some(()))
    }

    fn name(&self) -> &'static str {
        "Uplink"
    }
}
