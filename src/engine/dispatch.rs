//! Inbound side: session events to playback, transcripts and callbacks.

use crate::audio::sink::SegmentId;
use crate::codec;
use crate::engine::EngineCallbacks;
use crate::engine::session::Session;
use crate::error::ParleyError;
use crate::playback::PlaybackScheduler;
use crate::session::channel::SessionEvent;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

/// Why the dispatcher stopped.
#[derive(Debug)]
pub(crate) enum DispatchExit {
    /// Transport fault or remote error.
    Fault(ParleyError),
    /// The remote closed the session.
    RemoteClosed,
    /// The event stream ended because the session was closed locally.
    Ended,
}

/// Single owner of the session's conversation state.
pub(crate) struct Dispatcher {
    session: Session,
    scheduler: Arc<PlaybackScheduler>,
    callbacks: Arc<dyn EngineCallbacks>,
    closed: Arc<AtomicBool>,
    payloads_dropped: Arc<AtomicU64>,
}

impl Dispatcher {
    pub(crate) fn new(
        session: Session,
        scheduler: Arc<PlaybackScheduler>,
        callbacks: Arc<dyn EngineCallbacks>,
        closed: Arc<AtomicBool>,
        payloads_dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            session,
            scheduler,
            callbacks,
            closed,
            payloads_dropped,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) -> DispatchExit {
        while let Some(event) = events.recv().await {
            if self.closed.load(Ordering::SeqCst) {
                return DispatchExit::Ended;
            }
            match event {
                SessionEvent::Audio(payload) => self.on_audio(&payload),
                SessionEvent::Transcript { direction, text } => {
                    if let Some(full) = self.session.on_transcript(direction, &text)
                        && !self.closed.load(Ordering::SeqCst)
                    {
                        self.callbacks.on_message(&full, direction.is_user());
                    }
                }
                SessionEvent::TurnComplete => {
                    tracing::debug!(session = %self.session.id(), "turn complete");
                    self.session.on_turn_complete();
                }
                SessionEvent::Interrupted => {
                    let stopped = self.scheduler.interrupt();
                    self.session.on_interrupted();
                    tracing::info!(
                        session = %self.session.id(),
                        stopped = stopped.len(),
                        "barge-in"
                    );
                }
                SessionEvent::Fault(e) => return DispatchExit::Fault(e),
                SessionEvent::Closed => return DispatchExit::RemoteClosed,
            }
        }
        DispatchExit::Ended
    }

    fn on_audio(&mut self, payload: &codec::WirePayload) {
        let decoded = match codec::decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                let dropped = self.payloads_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(error = %e, dropped, "dropping undecodable audio payload");
                return;
            }
        };
        // Rejections are logged and counted by the scheduler.
        if let Err(e) = self.scheduler.enqueue(&decoded, self.session.next_prosody()) {
            tracing::debug!(error = %e, "segment not scheduled");
        }
    }
}

/// Forwards sink completions to the scheduler from a dedicated thread.
pub(crate) struct CompletionPump {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CompletionPump {
    const POLL: Duration = Duration::from_millis(50);

    pub(crate) fn spawn(
        completions: Receiver<SegmentId>,
        scheduler: Arc<PlaybackScheduler>,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("parley-completions".to_string())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    match completions.recv_timeout(Self::POLL) {
                        Ok(id) => scheduler.on_segment_ended(id),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("completion thread panicked");
        }
    }
}

impl Drop for CompletionPump {
    fn drop(&mut self) {
        self.stop();
    }
}
