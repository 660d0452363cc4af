//! Wire messages exchanged with the remote conversational engine.
//!
//! Every message is one JSON text frame tagged by `"type"`.

use crate::codec::WirePayload;
use crate::config::SessionConfig;
use serde::{Deserialize, Serialize};

/// Connect-time configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupMessage {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl From<&SessionConfig> for SetupMessage {
    fn from(config: &SessionConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: config.system_instruction.clone(),
            input_transcription: config.input_transcription,
            output_transcription: config.output_transcription,
        }
    }
}

/// Client to remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Setup(SetupMessage),
    Audio(WirePayload),
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Remote to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SetupComplete,
    Audio {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    InputTranscription {
        text: String,
    },
    OutputTranscription {
        text: String,
    },
    TurnComplete,
    Interrupted,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
