//! parley - duplex voice conversations with a remote speech engine
//!
//! Streams microphone audio to a session, schedules the spoken reply for
//! playback and stops it the moment the user barges in.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod codec;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod playback;
pub mod prosody;
pub mod session;
pub mod transcript;

// Device seams
pub use audio::devices::DeviceProvider;
pub use audio::sink::AudioSink;
pub use audio::source::AudioSource;
pub use session::transport::Connector;

// Engine
pub use engine::{EngineCallbacks, EngineStats, VoiceEngine};

// Error handling
pub use error::{ParleyError, Result};

// Config
pub use config::Config;

// Station framework
pub use pipeline::error::{ErrorReporter, StationError};
pub use pipeline::station::Station;

/// Build version string with optional git commit hash.
///
/// Returns `"0.0.1+abc1234"` when git hash is available, `"0.0.1"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
