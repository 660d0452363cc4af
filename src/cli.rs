//! Command-line interface for parley
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Duplex voice conversations from the terminal
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Duplex voice conversations from the terminal")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a live voice session (default)
    Run(RunArgs),

    /// List available audio input and output devices
    Devices,

    /// Print the effective configuration as TOML
    Config,
}

/// Overrides for a live session.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Session endpoint (ws:// or wss:// URL)
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Voice for the spoken replies
    #[arg(long, value_name = "NAME")]
    pub voice: Option<String>,

    /// Audio input device name
    #[arg(long, value_name = "DEVICE")]
    pub input_device: Option<String>,

    /// Audio output device name
    #[arg(long, value_name = "DEVICE")]
    pub output_device: Option<String>,

    /// How long to wait for the session to open. Examples: 10s, 1m
    #[arg(long, value_name = "DURATION", value_parser = parse_timeout)]
    pub connect_timeout: Option<Duration>,

    /// Stream a WAV file instead of the microphone
    #[arg(long, value_name = "FILE")]
    pub wav: Option<PathBuf>,
}

/// Parse a timeout string.
///
/// Bare numbers are seconds; anything else goes through `humantime`
/// (`500ms`, `10s`, `1m30s`).
fn parse_timeout(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let duration = match s.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(s).map_err(|e| e.to_string())?,
    };
    if duration.is_zero() {
        return Err("timeout must be positive".to_string());
    }
    Ok(duration)
}

impl RunArgs {
    /// Apply the overrides on top of a loaded configuration.
    pub fn apply(&self, config: &mut crate::config::Config) {
        if let Some(endpoint) = &self.endpoint {
            config.session.endpoint = endpoint.clone();
        }
        if let Some(voice) = &self.voice {
            config.session.voice = voice.clone();
        }
        if let Some(device) = &self.input_device {
            config.audio.input_device = Some(device.clone());
        }
        if let Some(device) = &self.output_device {
            config.audio.output_device = Some(device.clone());
        }
        if let Some(timeout) = self.connect_timeout {
            config.session.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        }
    }
}
