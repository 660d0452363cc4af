//! Capture framer: turns a polled `AudioSource` into fixed-size frames.
//!
//! The capture thread never waits on its consumer. When the frame queue is
//! full the newest frame is dropped and counted, which bounds capture latency.

use crate::audio::source::AudioSource;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crossbeam_channel::{Receiver, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A block of 16 kHz mono PCM produced by the capture device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Vec<i16>,
    timestamp: Instant,
    sequence: u64,
    level: f32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, timestamp: Instant, sequence: u64) -> Self {
        let level = calculate_rms(&samples);
        Self {
            samples,
            timestamp,
            sequence,
            level,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Capture time of the frame's last sample.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Normalized RMS level (0.0 = silence, 1.0 = full scale).
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / defaults::CAPTURE_SAMPLE_RATE as f64)
    }
}

/// Calculates the normalized Root Mean Square of 16-bit PCM samples.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = s as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();
    ((sum_squares / samples.len() as f64).sqrt() as f32).min(1.0)
}

/// Framer settings.
#[derive(Debug, Clone, Copy)]
pub struct FramerConfig {
    pub frame_samples: usize,
    /// Frames buffered before new frames are dropped
    pub queue: usize,
    pub poll_interval: Duration,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            frame_samples: defaults::FRAME_SAMPLES,
            queue: defaults::CAPTURE_QUEUE,
            poll_interval: Duration::from_millis(defaults::CAPTURE_POLL_MS),
        }
    }
}

#[derive(Debug, Default)]
struct FramerStats {
    produced: AtomicU64,
    dropped: AtomicU64,
}

/// Receiving end of the capture queue.
pub type FrameStream = Receiver<AudioFrame>;

/// Owns the capture thread and, through it, the input device.
pub struct CaptureFramer {
    running: Arc<AtomicBool>,
    stats: Arc<FramerStats>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureFramer {
    /// Start the source and spawn the capture thread.
    ///
    /// Returns the framer (for `close()`) and the stream of frames. The stream
    /// disconnects when the framer closes or a finite source runs out.
    ///
    /// # Errors
    /// `ParleyError::DeviceUnavailable` if the source cannot be started.
    pub fn open(
        mut source: Box<dyn AudioSource>,
        config: FramerConfig,
    ) -> Result<(Self, FrameStream)> {
        if config.frame_samples == 0 || config.queue == 0 {
            return Err(ParleyError::ConfigInvalidValue {
                key: "audio.frame_samples".to_string(),
                message: "frame size and queue must be positive".to_string(),
            });
        }

        source.start().map_err(|e| match e {
            ParleyError::DeviceUnavailable { .. } => e,
            other => ParleyError::device("input", other.to_string()),
        })?;

        let (frame_tx, frame_rx) = bounded(config.queue);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(FramerStats::default());

        let thread_running = Arc::clone(&running);
        let thread_stats = Arc::clone(&stats);
        let spawned = thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                capture_loop(source.as_mut(), &frame_tx, &thread_running, &thread_stats, config);
                if let Err(e) = source.stop() {
                    tracing::warn!(error = %e, "failed to stop audio capture");
                }
                tracing::debug!(
                    produced = thread_stats.produced.load(Ordering::Relaxed),
                    dropped = thread_stats.dropped.load(Ordering::Relaxed),
                    "capture thread finished"
                );
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return Err(ParleyError::device(
                    "input",
                    format!("Failed to spawn capture thread: {}", e),
                ));
            }
        };

        Ok((
            Self {
                running,
                stats,
                handle: Some(handle),
            },
            frame_rx,
        ))
    }

    /// Stop production and release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("capture thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Frames delivered to the queue.
    pub fn frames_produced(&self) -> u64 {
        self.stats.produced.load(Ordering::Relaxed)
    }

    /// Frames discarded because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureFramer {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_loop(
    source: &mut dyn AudioSource,
    frame_tx: &crossbeam_channel::Sender<AudioFrame>,
    running: &AtomicBool,
    stats: &FramerStats,
    config: FramerConfig,
) {
    const MAX_CONSECUTIVE_ERRORS: u32 = 10;

    let finite = source.is_finite();
    let started = Instant::now();
    let mut pending: Vec<i16> = Vec::with_capacity(config.frame_samples * 2);
    let mut sequence: u64 = 0;
    let mut samples_read: u64 = 0;
    let mut consecutive_errors: u32 = 0;

    let emit = |samples: Vec<i16>, sequence: &mut u64| -> bool {
        let frame = AudioFrame::new(samples, Instant::now(), *sequence);
        *sequence += 1;
        match frame_tx.try_send(frame) {
            Ok(()) => {
                stats.produced.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 50 == 0 {
                    tracing::warn!(dropped, "uplink behind, dropping capture frames");
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    };

    while running.load(Ordering::SeqCst) {
        let samples = match source.read_samples() {
            Ok(s) => {
                consecutive_errors = 0;
                s
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!(
                        error = %e,
                        consecutive_errors,
                        "audio capture keeps failing, stopping capture"
                    );
                    break;
                }
                thread::sleep(config.poll_interval);
                continue;
            }
        };

        if samples.is_empty() {
            if finite {
                if !pending.is_empty() {
                    let tail = std::mem::take(&mut pending);
                    emit(tail, &mut sequence);
                }
                break;
            }
            thread::sleep(config.poll_interval);
            continue;
        }

        samples_read += samples.len() as u64;
        pending.extend_from_slice(&samples);

        while pending.len() >= config.frame_samples {
            let frame: Vec<i16> = pending.drain(..config.frame_samples).collect();
            if !emit(frame, &mut sequence) {
                return;
            }
        }

        if finite {
            // Replay file sources in real time.
            let audio_time = Duration::from_secs_f64(
                samples_read as f64 / defaults::CAPTURE_SAMPLE_RATE as f64,
            );
            if let Some(ahead) = audio_time.checked_sub(started.elapsed()) {
                thread::sleep(ahead.min(Duration::from_millis(250)));
            }
        } else {
            thread::sleep(config.poll_interval);
        }
    }
}
