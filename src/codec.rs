//! Transport codec: PCM audio to and from the wire envelope.
//!
//! Outbound frames are 16 kHz mono i16, sent as base64 of the little-endian
//! bytes. Inbound audio is the same encoding at 24 kHz and is decoded to
//! `f32` samples for the playback mixer.

use crate::audio::framer::AudioFrame;
use crate::defaults;
use crate::error::{ParleyError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Audio as carried inside a session message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub mime_type: String,
    /// Base64 of little-endian 16-bit PCM.
    pub data: String,
}

/// Decoded inbound audio, ready for scheduling.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Length in seconds at 1x playback.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Encode a capture frame for transmission.
pub fn encode(frame: &AudioFrame) -> WirePayload {
    encode_samples(frame.samples(), defaults::CAPTURE_MIME)
}

/// Encode raw i16 samples with the given MIME type.
pub fn encode_samples(samples: &[i16], mime_type: &str) -> WirePayload {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    WirePayload {
        mime_type: mime_type.to_string(),
        data: STANDARD.encode(bytes),
    }
}

/// Decode an inbound audio payload.
///
/// # Errors
/// `ParleyError::Codec` for invalid base64, an odd byte count or a
/// non-PCM MIME type.
pub fn decode(payload: &WirePayload) -> Result<DecodedAudio> {
    let sample_rate = parse_rate(&payload.mime_type)?;
    let bytes = STANDARD
        .decode(payload.data.as_bytes())
        .map_err(|e| ParleyError::codec(format!("invalid base64: {}", e)))?;
    if bytes.len() % 2 != 0 {
        return Err(ParleyError::codec(format!(
            "odd PCM byte count ({})",
            bytes.len()
        )));
    }

    let samples: Arc<[f32]> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Sample rate from a MIME type such as `audio/pcm;rate=24000`.
///
/// A bare `audio/pcm` (or an empty type) means the playback default.
fn parse_rate(mime_type: &str) -> Result<u32> {
    let mime_type = mime_type.trim();
    if mime_type.is_empty() {
        return Ok(defaults::PLAYBACK_SAMPLE_RATE);
    }

    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next().unwrap_or_default();
    if !essence.eq_ignore_ascii_case("audio/pcm") {
        return Err(ParleyError::codec(format!(
            "unsupported audio type '{}'",
            mime_type
        )));
    }

    for param in parts {
        if let Some(value) = param.strip_prefix("rate=") {
            return match value.parse::<u32>() {
                Ok(rate) if rate > 0 => Ok(rate),
                _ => Err(ParleyError::codec(format!("invalid sample rate '{}'", value))),
            };
        }
    }
    Ok(defaults::PLAYBACK_SAMPLE_RATE)
}
