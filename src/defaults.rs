//! Default configuration constants for parley.
//!
//! Shared by the config types, the codec and the audio stages so the wire
//! format and the device formats cannot drift apart.

/// Capture sample rate in Hz (16 kHz mono, 16-bit signed on the wire).
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Playback sample rate in Hz of the audio the remote engine sends back.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Samples per capture frame.
///
/// 4096 samples at 16 kHz is 256 ms of audio per outbound message.
pub const FRAME_SAMPLES: usize = 4096;

/// Capture frames buffered between the framer and the uplink before
/// frames start being dropped.
pub const CAPTURE_QUEUE: usize = 8;

/// Outbound messages queued on the session channel.
pub const OUTBOUND_QUEUE: usize = 64;

/// Inbound events queued between the session channel and the dispatcher.
pub const EVENT_QUEUE: usize = 256;

/// Time allowed for the remote engine to acknowledge the setup message.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// How often the capture thread polls its source.
pub const CAPTURE_POLL_MS: u64 = 16;

/// MIME type of outbound audio payloads.
pub const CAPTURE_MIME: &str = "audio/pcm;rate=16000";

/// MIME type of inbound audio payloads.
pub const PLAYBACK_MIME: &str = "audio/pcm;rate=24000";

/// Slowest playback rate the scheduler will apply.
pub const MIN_PLAYBACK_RATE: f32 = 0.5;

/// Fastest playback rate the scheduler will apply.
pub const MAX_PLAYBACK_RATE: f32 = 2.0;

/// Loudest gain the scheduler will apply.
pub const MAX_GAIN: f32 = 2.0;

/// Default speech model requested at setup.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Default prebuilt voice requested at setup.
pub const DEFAULT_VOICE: &str = "Kore";

/// Default system instruction sent at setup.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "Speak naturally like a real human. \
Be concise, professional, and conversational. Support barge-in interruption naturally.";

/// Environment variable holding the API credential.
pub const API_KEY_ENV: &str = "PARLEY_API_KEY";
