//! Error types for parley.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    // Configuration errors
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Device errors (fatal to start)
    #[error("Audio device unavailable ({device}): {message}")]
    DeviceUnavailable { device: String, message: String },

    // Codec errors (recovered locally)
    #[error("Codec error: {message}")]
    Codec { message: String },

    // Transport errors (terminal for the session)
    #[error("Session channel fault: {message}")]
    ChannelFault { message: String },

    // Playback errors (recovered locally)
    #[error("Audio sink rejected segment: {message}")]
    SinkRejection { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl ParleyError {
    /// Shorthand for a device error.
    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Shorthand for a channel fault.
    pub fn fault(message: impl Into<String>) -> Self {
        Self::ChannelFault {
            message: message.into(),
        }
    }

    /// Whether this error ends the session and must reach the caller.
    ///
    /// Codec and sink errors are recovered where they happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ParleyError::DeviceUnavailable { .. } | ParleyError::ChannelFault { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
