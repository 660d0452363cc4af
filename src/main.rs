use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use parley::audio::capture::{list_input_devices, list_output_devices};
use parley::audio::devices::{CpalDevices, DeviceProvider, WavDevices};
use parley::cli::{Cli, Commands, RunArgs};
use parley::config::Config;
use parley::error::ParleyError;
use parley::session::websocket::WebSocketConnector;
use parley::{EngineCallbacks, VoiceEngine};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            run_session(config, RunArgs::default(), cli.quiet).await?;
        }
        Some(Commands::Run(args)) => {
            let config = load_config(cli.config.as_deref())?;
            run_session(config, args, cli.quiet).await?;
        }
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Config) => {
            let config = load_config(cli.config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Install the log subscriber. `RUST_LOG` wins over `-v`.
fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "parley=info",
        (false, 2) => "parley=debug",
        (false, _) => "parley=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/parley/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path).with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

/// List available audio devices.
fn list_audio_devices() -> Result<()> {
    let inputs = list_input_devices()?;
    let outputs = list_output_devices()?;

    if inputs.is_empty() && outputs.is_empty() {
        eprintln!("No audio devices found");
        std::process::exit(1);
    }

    println!("Input devices:");
    for (idx, device) in inputs.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }
    println!("Output devices:");
    for (idx, device) in outputs.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

/// Run one live session until Ctrl-C or until the session ends.
async fn run_session(mut config: Config, args: RunArgs, quiet: bool) -> Result<()> {
    args.apply(&mut config);
    config.validate()?;

    let cpal = CpalDevices::new(config.audio.input_device.clone(), config.audio.output_device.clone());
    let devices: Arc<dyn DeviceProvider> = match &args.wav {
        Some(path) => Arc::new(WavDevices::new(path, cpal)),
        None => Arc::new(cpal),
    };

    let api_key = config.session.api_key();
    if api_key.is_none() {
        tracing::warn!(
            env = %config.session.api_key_env,
            "no API key in environment, connecting without credentials"
        );
    }
    let connector = Arc::new(WebSocketConnector::new(config.session.endpoint.clone(), api_key));

    let terminal = Arc::new(TerminalCallbacks::new(quiet));
    let engine = VoiceEngine::new(devices, connector);
    engine.start(&config, terminal.clone()).await?;

    if !quiet {
        eprintln!("{}", "Listening. Press Ctrl-C to end the conversation.".dimmed());
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            }
        }
        () = terminal.ended.notified() => {}
    }

    engine.stop().await;
    terminal.finish_line();

    if terminal.failed.load(Ordering::SeqCst) {
        anyhow::bail!("session ended with an error");
    }
    Ok(())
}

/// Prints transcripts as they grow, one line per speaker turn.
struct TerminalCallbacks {
    quiet: bool,
    last_side: Mutex<Option<bool>>,
    ended: Notify,
    failed: AtomicBool,
}

impl TerminalCallbacks {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            last_side: Mutex::new(None),
            ended: Notify::new(),
            failed: AtomicBool::new(false),
        }
    }

    fn finish_line(&self) {
        if let Ok(mut last) = self.last_side.lock()
            && last.take().is_some()
        {
            eprintln!();
        }
    }
}

impl EngineCallbacks for TerminalCallbacks {
    fn on_message(&self, text: &str, is_user: bool) {
        if self.quiet {
            return;
        }
        let Ok(mut last) = self.last_side.lock() else {
            return;
        };
        if last.is_some_and(|side| side != is_user) {
            eprintln!();
        }
        *last = Some(is_user);

        let mut stderr = std::io::stderr().lock();
        let line = if is_user {
            format!("\r\x1b[2K{} {}", "you:".cyan().bold(), text)
        } else {
            format!("\r\x1b[2K{} {}", "ai: ".green().bold(), text)
        };
        if let Err(e) = write!(stderr, "{}", line).and_then(|()| stderr.flush()) {
            tracing::debug!(error = %e, "failed to print transcript");
        }
    }

    fn on_error(&self, error: &ParleyError) {
        self.finish_line();
        eprintln!("{} {}", "Session error:".red().bold(), error);
        self.failed.store(true, Ordering::SeqCst);
        self.ended.notify_one();
    }

    fn on_close(&self) {
        self.finish_line();
        if !self.quiet {
            eprintln!("{}", "Session closed by remote.".yellow());
        }
        self.ended.notify_one();
    }
}
