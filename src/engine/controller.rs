//! Lifecycle controller: owns every resource of the running session.
//!
//! Startup order is output sink, input device, session channel, capture
//! framer, then the stages between them. A failure at any step releases
//! whatever was already acquired before the error is returned.
//!
//! Teardown is shared by `stop()` and by the dispatcher when the session
//! faults or the remote closes it. Whoever takes the session out of the slot
//! performs the teardown; everyone else finds the slot empty.
//!
//! The slot is never locked while a session is being acquired. Each start
//! carries a cancellation token that `stop()` or a newer `start()` fires; a
//! cancelled start releases what it holds and never installs its session.
//! Starts run one at a time, and both the next start and `stop()` wait for a
//! cancelled start to finish releasing before going on.

use crate::audio::devices::DeviceProvider;
use crate::audio::framer::{CaptureFramer, FramerConfig};
use crate::audio::sink::AudioSink;
use crate::config::Config;
use crate::defaults;
use crate::engine::dispatch::{CompletionPump, DispatchExit, Dispatcher};
use crate::engine::session::Session;
use crate::engine::uplink::EncoderStation;
use crate::engine::{EngineCallbacks, EngineStats};
use crate::error::{ParleyError, Result};
use crate::pipeline::error::SessionReporter;
use crate::pipeline::station::StationRunner;
use crate::playback::{PlaybackLimits, PlaybackScheduler};
use crate::session::channel::{ChannelConfig, SessionChannel, SessionState};
use crate::session::transport::Connector;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Slot = Arc<Mutex<Option<ActiveSession>>>;

/// Everything acquired for one session.
struct ActiveSession {
    id: Uuid,
    channel: SessionChannel,
    framer: CaptureFramer,
    uplink: StationRunner<EncoderStation>,
    pump: CompletionPump,
    scheduler: Arc<PlaybackScheduler>,
    sink: Arc<dyn AudioSink>,
    dispatcher: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
    payloads_dropped: Arc<AtomicU64>,
    frames_encoded: Arc<AtomicU64>,
}

impl ActiveSession {
    fn stats(&self) -> EngineStats {
        EngineStats {
            session_id: Some(self.id),
            state: self.channel.state(),
            frames_sent: self.channel.sent(),
            frames_dropped: self.framer.dropped_frames() + self.channel.dropped_sends(),
            segments_active: self.scheduler.active_count(),
            segments_scheduled: self.scheduler.scheduled_total(),
            segments_rejected: self.scheduler.rejected_total(),
            interrupts: self.scheduler.interrupt_count(),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            payloads_dropped: self.payloads_dropped.load(Ordering::Relaxed)
                + self.channel.malformed_frames(),
        }
    }

    /// Release everything. `from_dispatcher` is set when the dispatcher
    /// task itself is tearing down and must not be awaited.
    async fn shutdown(self, from_dispatcher: bool) {
        let ActiveSession {
            id,
            mut channel,
            framer,
            uplink,
            pump,
            scheduler,
            sink,
            dispatcher,
            closed,
            ..
        } = self;

        closed.store(true, Ordering::SeqCst);

        if let Some(dispatcher) = dispatcher
            && !from_dispatcher
        {
            dispatcher.abort();
            if let Err(e) = dispatcher.await
                && !e.is_cancelled()
            {
                tracing::warn!(session = %id, error = %e, "dispatcher task failed");
            }
        }

        channel.close().await;
        scheduler.reset();
        sink.close();

        // Joining the capture, uplink and completion threads blocks briefly.
        let joined = tokio::task::spawn_blocking(move || {
            let mut framer = framer;
            let mut pump = pump;
            framer.close();
            if let Err(e) = uplink.join() {
                tracing::error!(session = %id, error = %e, "uplink did not stop cleanly");
            }
            pump.stop();
        })
        .await;
        if let Err(e) = joined {
            tracing::error!(session = %id, error = %e, "capture shutdown failed");
        }

        tracing::info!(session = %id, "session stopped");
    }
}

/// Acquired resources during startup, released if a later step fails.
struct Startup {
    sink: Arc<dyn AudioSink>,
    channel: Option<SessionChannel>,
    framer: Option<CaptureFramer>,
}

impl Startup {
    async fn abandon(self, error: ParleyError) -> ParleyError {
        if let Some(mut framer) = self.framer {
            let closed = tokio::task::spawn_blocking(move || framer.close()).await;
            if let Err(e) = closed {
                tracing::error!(error = %e, "capture shutdown failed");
            }
        }
        if let Some(mut channel) = self.channel {
            channel.close().await;
        }
        self.sink.close();
        tracing::warn!(error = %error, "session start failed, resources released");
        error
    }
}

/// The start in flight, if any.
struct PendingStart {
    epoch: u64,
    cancel: CancellationToken,
}

/// Duplex voice engine with a single start/stop entry point.
///
/// At most one session runs at a time; `start` tears down the previous
/// session first.
pub struct VoiceEngine {
    devices: Arc<dyn DeviceProvider>,
    connector: Arc<dyn Connector>,
    slot: Slot,
    pending: std::sync::Mutex<Option<PendingStart>>,
    epochs: AtomicU64,
    starting: Mutex<()>,
}

impl VoiceEngine {
    pub fn new(devices: Arc<dyn DeviceProvider>, connector: Arc<dyn Connector>) -> Self {
        Self {
            devices,
            connector,
            slot: Arc::new(Mutex::new(None)),
            pending: std::sync::Mutex::new(None),
            epochs: AtomicU64::new(0),
            starting: Mutex::new(()),
        }
    }

    /// Start a session.
    ///
    /// Returns once the remote has acknowledged the setup and capture is
    /// running. Later failures are reported through `callbacks.on_error`.
    /// A `stop()` or another `start()` issued meanwhile cancels this one.
    ///
    /// # Errors
    /// `ParleyError::DeviceUnavailable` if either device cannot be acquired,
    /// `ParleyError::ChannelFault` if the session cannot be established or
    /// the start was cancelled, or a configuration error. Nothing is left
    /// running after an error.
    pub async fn start(&self, config: &Config, callbacks: Arc<dyn EngineCallbacks>) -> Result<()> {
        config.validate()?;

        let (epoch, cancel) = self.arm();
        let _turn = self.starting.lock().await;
        let result = if cancel.is_cancelled() {
            Err(ParleyError::fault("session start cancelled"))
        } else {
            self.run_start(config, callbacks, &cancel).await
        };
        self.disarm(epoch);
        result
    }

    async fn run_start(
        &self,
        config: &Config,
        callbacks: Arc<dyn EngineCallbacks>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let previous = self.slot.lock().await.take();
        if let Some(previous) = previous {
            tracing::info!(session = %previous.id, "replacing running session");
            previous.shutdown(false).await;
        }

        let (completion_tx, completion_rx) = crossbeam_channel::bounded(config.session.event_queue);
        let sink = self.devices.open_output(completion_tx)?;
        let mut startup = Startup {
            sink: Arc::clone(&sink),
            channel: None,
            framer: None,
        };

        let input = match self.devices.open_input() {
            Ok(input) => input,
            Err(e) => return Err(startup.abandon(e).await),
        };

        let mut channel = SessionChannel::new(ChannelConfig::from(&config.session));
        let id = channel.id();
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ParleyError::fault("session start cancelled")),
            connected = channel.connect(self.connector.as_ref()) => connected,
        };
        startup.channel = Some(channel);
        let events = match connected {
            Ok(events) => events,
            Err(e) => {
                drop(input);
                return Err(startup.abandon(e).await);
            }
        };

        let framer_config = FramerConfig {
            frame_samples: config.audio.frame_samples,
            queue: config.audio.capture_queue,
            poll_interval: Duration::from_millis(defaults::CAPTURE_POLL_MS),
        };
        let frames = match CaptureFramer::open(input, framer_config) {
            Ok((framer, frames)) => {
                startup.framer = Some(framer);
                frames
            }
            Err(e) => return Err(startup.abandon(e).await),
        };

        let scheduler = Arc::new(PlaybackScheduler::new(
            Arc::clone(&sink),
            PlaybackLimits::from(&config.playback),
        ));

        let pump = match CompletionPump::spawn(completion_rx, Arc::clone(&scheduler)) {
            Ok(pump) => pump,
            Err(e) => return Err(startup.abandon(e.into()).await),
        };

        let sender = match startup.channel.as_ref().map(SessionChannel::sender) {
            Some(Ok(sender)) => sender,
            Some(Err(e)) => return Err(startup.abandon(e).await),
            None => return Err(startup.abandon(ParleyError::fault("session missing")).await),
        };
        let encoder = EncoderStation::new(sender);
        let frames_encoded = encoder.encoded_counter();
        let reporter = Arc::new(SessionReporter::new(id));
        let uplink = match StationRunner::spawn_terminal(encoder, frames, reporter) {
            Ok(uplink) => uplink,
            Err(e) => return Err(startup.abandon(e.into()).await),
        };

        let (Some(channel), Some(framer)) = (startup.channel.take(), startup.framer.take()) else {
            return Err(startup.abandon(ParleyError::Other("startup state lost".to_string())).await);
        };

        let closed = Arc::new(AtomicBool::new(false));
        let payloads_dropped = Arc::new(AtomicU64::new(0));
        let mut active = ActiveSession {
            id,
            channel,
            framer,
            uplink,
            pump,
            scheduler: Arc::clone(&scheduler),
            sink,
            dispatcher: None,
            closed: Arc::clone(&closed),
            payloads_dropped: Arc::clone(&payloads_dropped),
            frames_encoded,
        };

        // The dispatcher starts under the slot lock so its own teardown
        // always finds this session installed.
        let mut slot = self.slot.lock().await;
        if cancel.is_cancelled() {
            drop(slot);
            active.shutdown(false).await;
            tracing::info!(session = %id, "session start cancelled");
            return Err(ParleyError::fault("session start cancelled"));
        }
        let dispatcher = Dispatcher::new(
            Session::new(id, config.playback.prosody),
            scheduler,
            Arc::clone(&callbacks),
            closed,
            payloads_dropped,
        );
        active.dispatcher = Some(tokio::spawn(supervise(
            dispatcher,
            events,
            Arc::clone(&self.slot),
            id,
            callbacks,
        )));
        let replaced = slot.replace(active);
        drop(slot);

        if let Some(replaced) = replaced {
            replaced.shutdown(false).await;
        }
        tracing::info!(session = %id, "session started");
        Ok(())
    }

    /// Register a new start, cancelling the one in flight.
    fn arm(&self) -> (u64, CancellationToken) {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = self.pending_guard().replace(PendingStart {
            epoch,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        (epoch, cancel)
    }

    fn disarm(&self, epoch: u64) {
        let mut pending = self.pending_guard();
        if pending.as_ref().is_some_and(|p| p.epoch == epoch) {
            pending.take();
        }
    }

    fn pending_guard(&self) -> std::sync::MutexGuard<'_, Option<PendingStart>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stop the running session, if any, and cancel a start in progress.
    /// Safe to call any number of times.
    pub async fn stop(&self) {
        let pending = self.pending_guard().take();
        if let Some(pending) = pending {
            pending.cancel.cancel();
        }
        // A cancelled start finishes releasing its devices first.
        let _turn = self.starting.lock().await;
        let active = self.slot.lock().await.take();
        if let Some(active) = active {
            active.shutdown(false).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Snapshot of the running session, or an idle snapshot.
    pub async fn stats(&self) -> EngineStats {
        match self.slot.lock().await.as_ref() {
            Some(active) => active.stats(),
            None => EngineStats::default(),
        }
    }
}

/// Tear down the session in `slot` if it is still session `id`.
///
/// Returns whether this call performed the teardown.
async fn teardown_if_current(slot: &Slot, id: Uuid) -> bool {
    let active = {
        let mut guard = slot.lock().await;
        if guard.as_ref().is_none_or(|active| active.id != id) {
            return false;
        }
        guard.take()
    };
    match active {
        Some(active) => {
            active.shutdown(true).await;
            true
        }
        None => false,
    }
}

/// Run the dispatcher, then handle how the session ended.
async fn supervise(
    dispatcher: Dispatcher,
    events: tokio::sync::mpsc::Receiver<crate::session::channel::SessionEvent>,
    slot: Slot,
    id: Uuid,
    callbacks: Arc<dyn EngineCallbacks>,
) {
    match dispatcher.run(events).await {
        DispatchExit::Fault(error) => {
            if teardown_if_current(&slot, id).await {
                tracing::error!(session = %id, error = %error, "session failed");
                callbacks.on_error(&error);
            }
        }
        DispatchExit::RemoteClosed => {
            if teardown_if_current(&slot, id).await {
                callbacks.on_close();
            }
        }
        DispatchExit::Ended => {}
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            frames_sent: 0,
            frames_dropped: 0,
            segments_active: 0,
            segments_scheduled: 0,
            segments_rejected: 0,
            interrupts: 0,
            frames_encoded: 0,
            payloads_dropped: 0,
        }
    }
}
