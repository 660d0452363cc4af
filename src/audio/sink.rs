//! Output side of device I/O: a sink that plays buffers at absolute times.

use crate::error::{ParleyError, Result};
use crossbeam_channel::Sender;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Stable identity of a scheduled segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u64);

impl SegmentId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg-{}", self.0)
    }
}

/// A buffer handed to the sink for playback.
#[derive(Debug, Clone)]
pub struct SinkSegment {
    pub id: SegmentId,
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// Start time on the sink clock, in seconds.
    pub start: f64,
    pub rate: f32,
    pub gain: f32,
}

impl SinkSegment {
    /// Wall-clock length once the playback rate is applied.
    pub fn effective_duration(&self) -> f64 {
        if self.sample_rate == 0 || self.rate <= 0.0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64 / self.rate as f64
    }
}

/// Playback device with a monotonic clock and schedule-at-timestamp.
///
/// Completion ("ended") notifications are delivered on the channel the sink
/// was opened with, never for segments removed through `stop`.
pub trait AudioSink: Send + Sync {
    /// Current sink clock in seconds. Monotonic, starts at zero.
    fn now(&self) -> f64;

    /// Play `segment` starting at `segment.start`.
    ///
    /// # Errors
    /// `ParleyError::SinkRejection` if the device refuses the segment.
    fn schedule(&self, segment: SinkSegment) -> Result<()>;

    /// Stop a segment immediately, whether playing or still pending.
    fn stop(&self, id: SegmentId);

    /// Release the output device. Safe to call repeatedly.
    fn close(&self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct ManualSinkState {
    clock: f64,
    scheduled: Vec<SinkSegment>,
    stopped: Vec<SegmentId>,
}

/// Sink driven by hand: the clock only moves when told to.
///
/// Records every `schedule` and `stop` call, can reject upcoming segments, and
/// reports completions on request. Used by tests and headless runs.
#[derive(Debug, Default)]
pub struct ManualSink {
    state: Mutex<ManualSinkState>,
    completions: Option<Sender<SegmentId>>,
    rejections: AtomicU32,
    closed: AtomicBool,
}

impl ManualSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver completions to `completions`.
    pub fn with_completions(mut self, completions: Sender<SegmentId>) -> Self {
        self.completions = Some(completions);
        self
    }

    pub fn set_now(&self, seconds: f64) {
        let mut state = lock(&self.state);
        state.clock = state.clock.max(seconds);
    }

    pub fn advance(&self, seconds: f64) {
        let mut state = lock(&self.state);
        state.clock += seconds.max(0.0);
    }

    /// Reject the next `count` calls to `schedule`.
    pub fn reject_next(&self, count: u32) {
        self.rejections.store(count, Ordering::SeqCst);
    }

    /// Every segment accepted so far, in call order.
    pub fn scheduled(&self) -> Vec<SinkSegment> {
        lock(&self.state).scheduled.clone()
    }

    /// Every segment stopped so far, in call order.
    pub fn stopped(&self) -> Vec<SegmentId> {
        lock(&self.state).stopped.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report `id` as played to the end.
    pub fn finish(&self, id: SegmentId) {
        if let Some(completions) = &self.completions
            && completions.send(id).is_err()
        {
            tracing::debug!(%id, "completion receiver gone");
        }
    }

    /// Report every accepted, unstopped segment that ends by the current clock.
    pub fn finish_due(&self) -> Vec<SegmentId> {
        let due: Vec<SegmentId> = {
            let state = lock(&self.state);
            state
                .scheduled
                .iter()
                .filter(|seg| !state.stopped.contains(&seg.id))
                .filter(|seg| seg.start + seg.effective_duration() <= state.clock)
                .map(|seg| seg.id)
                .collect()
        };
        for id in &due {
            self.finish(*id);
        }
        due
    }
}

impl AudioSink for ManualSink {
    fn now(&self) -> f64 {
        lock(&self.state).clock
    }

    fn schedule(&self, segment: SinkSegment) -> Result<()> {
        if self.is_closed() {
            return Err(ParleyError::SinkRejection {
                message: "sink closed".to_string(),
            });
        }
        let pending = self.rejections.load(Ordering::SeqCst);
        if pending > 0 {
            self.rejections.store(pending - 1, Ordering::SeqCst);
            return Err(ParleyError::SinkRejection {
                message: format!("{} refused by device", segment.id),
            });
        }
        lock(&self.state).scheduled.push(segment);
        Ok(())
    }

    fn stop(&self, id: SegmentId) {
        lock(&self.state).stopped.push(id);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
