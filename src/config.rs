use crate::defaults;
use crate::error::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
}

/// Connect-time configuration of one duplex session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint of the remote engine (ws:// or wss://)
    pub endpoint: String,
    pub model: String,
    /// Voice identity the remote engine speaks with
    pub voice: String,
    pub system_instruction: String,
    /// Subscribe to transcription of the user's speech
    pub input_transcription: bool,
    /// Subscribe to transcription of the synthesized speech
    pub output_transcription: bool,
    pub connect_timeout_ms: u64,
    pub outbound_queue: usize,
    pub event_queue: usize,
    /// Name of the environment variable holding the API credential
    pub api_key_env: String,
}

/// Audio device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub frame_samples: usize,
    pub capture_queue: usize,
}

/// Playback modulation limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub min_rate: f32,
    pub max_rate: f32,
    pub max_gain: f32,
    /// Derive rate/gain from the output transcript; false plays everything neutral
    pub prosody: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8765/live".to_string(),
            model: defaults::DEFAULT_MODEL.to_string(),
            voice: defaults::DEFAULT_VOICE.to_string(),
            system_instruction: defaults::DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_transcription: true,
            output_transcription: true,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            outbound_queue: defaults::OUTBOUND_QUEUE,
            event_queue: defaults::EVENT_QUEUE,
            api_key_env: defaults::API_KEY_ENV.to_string(),
        }
    }
}

impl SessionConfig {
    /// Read the API credential from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            frame_samples: defaults::FRAME_SAMPLES,
            capture_queue: defaults::CAPTURE_QUEUE,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_rate: defaults::MIN_PLAYBACK_RATE,
            max_rate: defaults::MAX_PLAYBACK_RATE,
            max_gain: defaults::MAX_GAIN,
            prosody: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - PARLEY_ENDPOINT → session.endpoint
    /// - PARLEY_VOICE → session.voice
    /// - PARLEY_INPUT_DEVICE → audio.input_device
    /// - PARLEY_OUTPUT_DEVICE → audio.output_device
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("PARLEY_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.session.endpoint = endpoint;
        }

        if let Ok(voice) = std::env::var("PARLEY_VOICE")
            && !voice.is_empty()
        {
            self.session.voice = voice;
        }

        if let Ok(device) = std::env::var("PARLEY_INPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.input_device = Some(device);
        }

        if let Ok(device) = std::env::var("PARLEY_OUTPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.output_device = Some(device);
        }

        self
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, message: &str| ParleyError::ConfigInvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        let playback = &self.playback;
        if !(playback.min_rate > 0.0 && playback.min_rate <= 1.0) {
            return Err(invalid("playback.min_rate", "must be in (0, 1]"));
        }
        if !(playback.max_rate >= 1.0 && playback.max_rate.is_finite()) {
            return Err(invalid("playback.max_rate", "must be finite and >= 1"));
        }
        if !(playback.max_gain > 0.0 && playback.max_gain.is_finite()) {
            return Err(invalid("playback.max_gain", "must be finite and positive"));
        }
        if self.audio.frame_samples == 0 {
            return Err(invalid("audio.frame_samples", "must be positive"));
        }
        if self.audio.capture_queue == 0 {
            return Err(invalid("audio.capture_queue", "must be positive"));
        }
        if self.session.outbound_queue == 0 {
            return Err(invalid("session.outbound_queue", "must be positive"));
        }
        if self.session.event_queue == 0 {
            return Err(invalid("session.event_queue", "must be positive"));
        }
        if !(self.session.endpoint.starts_with("ws://") || self.session.endpoint.starts_with("wss://"))
        {
            return Err(invalid("session.endpoint", "must be a ws:// or wss:// URL"));
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/parley/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_parley_env() {
        remove_env("PARLEY_ENDPOINT");
        remove_env("PARLEY_VOICE");
        remove_env("PARLEY_INPUT_DEVICE");
        remove_env("PARLEY_OUTPUT_DEVICE");
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.session.voice, "Kore");
        assert!(config.session.input_transcription);
        assert!(config.session.output_transcription);
        assert_eq!(config.session.connect_timeout_ms, 10_000);

        assert_eq!(config.audio.input_device, None);
        assert_eq!(config.audio.frame_samples, 4096);
        assert_eq!(config.audio.capture_queue, 8);

        assert_eq!(config.playback.min_rate, 0.5);
        assert_eq!(config.playback.max_rate, 2.0);
        assert!(config.playback.prosody);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [session]
            endpoint = "wss://voice.example.com/live"
            voice = "Puck"
            input_transcription = false

            [audio]
            input_device = "pipewire"
            frame_samples = 2048

            [playback]
            max_rate = 1.5
            prosody = false
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.session.endpoint, "wss://voice.example.com/live");
        assert_eq!(config.session.voice, "Puck");
        assert!(!config.session.input_transcription);
        assert!(config.session.output_transcription);
        assert_eq!(config.audio.input_device, Some("pipewire".to_string()));
        assert_eq!(config.audio.frame_samples, 2048);
        assert_eq!(config.playback.max_rate, 1.5);
        assert!(!config.playback.prosody);
        assert_eq!(config.playback.min_rate, 0.5);
    }

    #[test]
    fn test_env_override_all() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_parley_env();

        set_env("PARLEY_ENDPOINT", "ws://localhost:9000");
        set_env("PARLEY_VOICE", "Charon");
        set_env("PARLEY_INPUT_DEVICE", "pulse");
        set_env("PARLEY_OUTPUT_DEVICE", "speakers");

        let config = Config::default().with_env_overrides();

        assert_eq!(config.session.endpoint, "ws://localhost:9000");
        assert_eq!(config.session.voice, "Charon");
        assert_eq!(config.audio.input_device, Some("pulse".to_string()));
        assert_eq!(config.audio.output_device, Some("speakers".to_string()));

        clear_parley_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_parley_env();

        set_env("PARLEY_VOICE", "");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.session.voice, "Kore");

        clear_parley_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[session\nvoice = \"broken").unwrap();

        assert!(Config::load(temp_file.path()).is_err());
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_parley_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = Config::default_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("parley"));
        assert!(path_str.ends_with("config.toml"));
    }

    #[test]
    fn test_validate_rejects_inverted_rate_range() {
        let mut config = Config::default();
        config.playback.min_rate = 1.5;
        match config.validate() {
            Err(ParleyError::ConfigInvalidValue { key, .. }) => {
                assert_eq!(key, "playback.min_rate")
            }
            other => panic!("Expected ConfigInvalidValue, got {:?}", other),
        }

        let mut config = Config::default();
        config.playback.max_rate = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sizes_and_bad_endpoint() {
        let mut config = Config::default();
        config.audio.frame_samples = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.event_queue = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.endpoint = "http://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serializes_back_to_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
