//! Gap-free playback scheduling with barge-in.
//!
//! Each segment starts where the previous one ends, or now if the sink has
//! already played past that point:
//!
//! `start = max(now, previous.start + previous.duration / previous.rate)`
//!
//! `interrupt` stops everything in flight and moves the baseline to now, so the
//! next segment never lands on a timestamp left over from the cancelled turn.
//!
//! Enqueue, completion and interrupt can come from different threads; all of
//! them go through one mutex around the arena.

use crate::audio::sink::{AudioSink, SegmentId, SinkSegment};
use crate::codec::DecodedAudio;
use crate::config::PlaybackConfig;
use crate::error::Result;
use crate::playback::arena::{PlaybackSegment, SegmentArena};
use crate::prosody::Prosody;
use std::sync::{Arc, Mutex, MutexGuard};

/// Rate and gain bounds applied to every segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackLimits {
    pub min_rate: f32,
    pub max_rate: f32,
    pub max_gain: f32,
}

impl Default for PlaybackLimits {
    fn default() -> Self {
        Self::from(&PlaybackConfig::default())
    }
}

impl From<&PlaybackConfig> for PlaybackLimits {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            min_rate: config.min_rate,
            max_rate: config.max_rate,
            max_gain: config.max_gain,
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    arena: SegmentArena,
    /// End of the last accepted segment; `None` before the first one.
    next_start: Option<f64>,
    scheduled: u64,
    rejected: u64,
    interrupts: u64,
}

pub struct PlaybackScheduler {
    sink: Arc<dyn AudioSink>,
    limits: PlaybackLimits,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<dyn AudioSink>, limits: PlaybackLimits) -> Self {
        Self {
            sink,
            limits,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Schedule `decoded` right after everything already queued.
    ///
    /// Empty buffers are skipped (`Ok(None)`).
    ///
    /// # Errors
    /// `ParleyError::SinkRejection` if the sink refuses the segment. The
    /// segment is dropped and the schedule is left as if it never arrived.
    pub fn enqueue(&self, decoded: &DecodedAudio, prosody: Prosody) -> Result<Option<SegmentId>> {
        if decoded.is_empty() {
            return Ok(None);
        }

        let prosody = prosody.clamped(self.limits.min_rate, self.limits.max_rate, self.limits.max_gain);
        let mut state = self.lock();

        let now = self.sink.now().max(0.0);
        let start = state.next_start.map_or(now, |next| next.max(now));
        let id = state.arena.allocate();
        let segment = PlaybackSegment {
            id,
            samples: Arc::clone(&decoded.samples),
            sample_rate: decoded.sample_rate,
            scheduled_start: start,
            rate: prosody.rate,
            gain: prosody.gain,
        };

        let submitted = self.sink.schedule(SinkSegment {
            id,
            samples: Arc::clone(&segment.samples),
            sample_rate: segment.sample_rate,
            start,
            rate: segment.rate,
            gain: segment.gain,
        });
        if let Err(e) = submitted {
            state.rejected += 1;
            tracing::warn!(segment = %id, error = %e, "sink rejected segment, dropped");
            return Err(e);
        }

        state.next_start = Some(segment.scheduled_end());
        state.scheduled += 1;
        tracing::trace!(
            segment = %id,
            start,
            duration = segment.effective_duration(),
            rate = segment.rate,
            "segment scheduled"
        );
        state.arena.insert(segment);
        Ok(Some(id))
    }

    /// The sink finished playing `id`. Unknown ids (already stopped) are ignored.
    pub fn on_segment_ended(&self, id: SegmentId) {
        if self.lock().arena.remove(id).is_some() {
            tracing::trace!(segment = %id, "segment ended");
        }
    }

    /// Barge-in: force-stop every active segment and restart the clock at now.
    ///
    /// Returns the ids that were stopped.
    pub fn interrupt(&self) -> Vec<SegmentId> {
        let mut state = self.lock();
        let stopped = self.stop_all(&mut state);
        state.next_start = Some(self.sink.now().max(0.0));
        state.interrupts += 1;
        if !stopped.is_empty() {
            tracing::info!(stopped = stopped.len(), "playback interrupted");
        }
        stopped
    }

    /// Stop everything and forget the schedule, as for a new session.
    pub fn reset(&self) {
        let mut state = self.lock();
        self.stop_all(&mut state);
        state.next_start = None;
    }

    fn stop_all(&self, state: &mut SchedulerState) -> Vec<SegmentId> {
        let stopped: Vec<SegmentId> = state.arena.drain().into_iter().map(|s| s.id).collect();
        for id in &stopped {
            self.sink.stop(*id);
        }
        stopped
    }

    /// Segments scheduled and not yet ended or stopped.
    pub fn active_count(&self) -> usize {
        self.lock().arena.len()
    }

    pub fn is_active(&self, id: SegmentId) -> bool {
        self.lock().arena.contains(id)
    }

    /// Scheduled start of an active segment.
    pub fn scheduled_start(&self, id: SegmentId) -> Option<f64> {
        self.lock().arena.get(id).map(|s| s.scheduled_start)
    }

    /// Where the next segment would start if enqueued right now.
    pub fn next_start(&self) -> f64 {
        let now = self.sink.now().max(0.0);
        self.lock().next_start.map_or(now, |next| next.max(now))
    }

    /// Segments accepted by the sink since creation.
    pub fn scheduled_total(&self) -> u64 {
        self.lock().scheduled
    }

    /// Segments refused by the sink since creation.
    pub fn rejected_total(&self) -> u64 {
        self.lock().rejected
    }

    /// Interruptions handled since creation.
    pub fn interrupt_count(&self) -> u64 {
        self.lock().interrupts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::ManualSink;
    use crate::error::ParleyError;

    fn audio(seconds: f64) -> DecodedAudio {
        DecodedAudio {
            samples: vec![0.1f32; (seconds * 24000.0).round() as usize].into(),
            sample_rate: 24000,
        }
    }

    fn scheduler() -> (Arc<ManualSink>, PlaybackScheduler) {
        let sink = Arc::new(ManualSink::new());
        let scheduler = PlaybackScheduler::new(sink.clone(), PlaybackLimits::default());
        (sink, scheduler)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_segment_starts_now() {
        let (sink, scheduler) = scheduler();
        sink.set_now(3.25);

        let id = scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap().unwrap();
        assert!(close(scheduler.scheduled_start(id).unwrap(), 3.25));
    }

    #[test]
    fn test_back_to_back_segments_are_gap_free() {
        let (_sink, scheduler) = scheduler();

        let first = scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap().unwrap();
        let _second = scheduler.enqueue(&audio(0.5), Prosody::NEUTRAL).unwrap().unwrap();
        let third = scheduler.enqueue(&audio(2.0), Prosody::NEUTRAL).unwrap().unwrap();

        let first_start = scheduler.scheduled_start(first).unwrap();
        let third_start = scheduler.scheduled_start(third).unwrap();
        assert!(close(third_start, first_start + 1.5));
    }

    #[test]
    fn test_starts_follow_formula_and_never_decrease() {
        let (sink, scheduler) = scheduler();
        let arrivals = [(0.0, 0.4, 1.0), (0.1, 0.3, 2.0), (2.0, 0.2, 0.5), (2.05, 1.0, 1.25)];

        let mut previous: Option<(f64, f64)> = None;
        for (arrive_at, seconds, rate) in arrivals {
            sink.set_now(arrive_at);
            let prosody = Prosody { rate, gain: 1.0 };
            let id = scheduler.enqueue(&audio(seconds), prosody).unwrap().unwrap();
            let start = scheduler.scheduled_start(id).unwrap();

            let expected = match previous {
                None => arrive_at,
                Some((prev_start, prev_effective)) => arrive_at.max(prev_start + prev_effective),
            };
            assert!(close(start, expected), "start {} != {}", start, expected);
            if let Some((prev_start, _)) = previous {
                assert!(start >= prev_start);
            }
            previous = Some((start, seconds / rate as f64));
        }
    }

    #[test]
    fn test_late_arrival_starts_at_now() {
        let (sink, scheduler) = scheduler();
        scheduler.enqueue(&audio(0.5), Prosody::NEUTRAL).unwrap();

        sink.set_now(4.0);
        let id = scheduler.enqueue(&audio(0.5), Prosody::NEUTRAL).unwrap().unwrap();
        assert!(close(scheduler.scheduled_start(id).unwrap(), 4.0));
    }

    #[test]
    fn test_interrupt_stops_everything_and_empties_active_set() {
        let (sink, scheduler) = scheduler();
        let a = scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap().unwrap();
        let b = scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap().unwrap();
        assert_eq!(scheduler.active_count(), 2);

        let stopped = scheduler.interrupt();

        assert_eq!(stopped, vec![a, b]);
        assert_eq!(sink.stopped(), vec![a, b]);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_enqueue_after_interrupt_is_not_stale() {
        let (sink, scheduler) = scheduler();
        for _ in 0..3 {
            scheduler.enqueue(&audio(2.0), Prosody::NEUTRAL).unwrap();
        }
        // Six seconds queued; the user barges in half a second later.
        sink.set_now(0.5);
        scheduler.interrupt();

        let id = scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap().unwrap();
        let start = scheduler.scheduled_start(id).unwrap();
        assert!(start >= sink.now());
        assert!(close(start, 0.5));
    }

    #[test]
    fn test_completion_removes_only_that_segment() {
        let (_sink, scheduler) = scheduler();
        let a = scheduler.enqueue(&audio(0.1), Prosody::NEUTRAL).unwrap().unwrap();
        let b = scheduler.enqueue(&audio(0.1), Prosody::NEUTRAL).unwrap().unwrap();
        let next = scheduler.next_start();

        scheduler.on_segment_ended(a);

        assert!(!scheduler.is_active(a));
        assert!(scheduler.is_active(b));
        assert!(close(scheduler.next_start(), next));

        // Completion for a segment that was already stopped is harmless.
        scheduler.interrupt();
        scheduler.on_segment_ended(b);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_rate_is_clamped_before_reaching_sink() {
        let (sink, scheduler) = scheduler();
        let wild = Prosody {
            rate: 10.0,
            gain: 5.0,
        };
        let first = scheduler.enqueue(&audio(1.0), wild).unwrap().unwrap();
        let second = scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap().unwrap();

        let submitted = sink.scheduled();
        assert_eq!(submitted[0].rate, 2.0);
        assert_eq!(submitted[0].gain, 2.0);
        // Clamped rate also drives the schedule: 1 s at 2x lasts 0.5 s.
        let gap = scheduler.scheduled_start(second).unwrap() - scheduler.scheduled_start(first).unwrap();
        assert!(close(gap, 0.5));
    }

    #[test]
    fn test_sink_rejection_drops_segment_and_keeps_going() {
        let (sink, scheduler) = scheduler();
        let first = scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap().unwrap();

        sink.reject_next(1);
        let rejected = scheduler.enqueue(&audio(5.0), Prosody::NEUTRAL);
        assert!(matches!(rejected, Err(ParleyError::SinkRejection { .. })));

        let third = scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap().unwrap();
        assert_eq!(scheduler.active_count(), 2);
        assert_eq!(scheduler.rejected_total(), 1);
        // The rejected five seconds left no hole.
        assert!(close(
            scheduler.scheduled_start(third).unwrap(),
            scheduler.scheduled_start(first).unwrap() + 1.0
        ));
    }

    #[test]
    fn test_empty_audio_is_skipped() {
        let (sink, scheduler) = scheduler();
        assert_eq!(scheduler.enqueue(&audio(0.0), Prosody::NEUTRAL).unwrap(), None);
        assert!(sink.scheduled().is_empty());
    }

    #[test]
    fn test_reset_forgets_schedule() {
        let (sink, scheduler) = scheduler();
        scheduler.enqueue(&audio(3.0), Prosody::NEUTRAL).unwrap();
        scheduler.reset();

        assert_eq!(scheduler.active_count(), 0);
        assert!(close(scheduler.next_start(), sink.now()));
        assert_eq!(scheduler.interrupt_count(), 0);
    }

    #[test]
    fn test_interrupts_are_counted() {
        let (_sink, scheduler) = scheduler();
        scheduler.enqueue(&audio(1.0), Prosody::NEUTRAL).unwrap();
        scheduler.interrupt();
        scheduler.interrupt();
        assert_eq!(scheduler.interrupt_count(), 2);
    }

    #[test]
    fn test_concurrent_completions_and_interrupts() {
        let (sink, scheduler) = scheduler();
        let scheduler = Arc::new(scheduler);
        let ids: Vec<SegmentId> = (0..200)
            .map(|_| scheduler.enqueue(&audio(0.01), Prosody::NEUTRAL).unwrap().unwrap())
            .collect();

        let completer = {
            let scheduler = Arc::clone(&scheduler);
            let ids = ids.clone();
            std::thread::spawn(move || {
                for id in ids {
                    scheduler.on_segment_ended(id);
                }
            })
        };
        scheduler.interrupt();
        completer.join().unwrap();

        assert_eq!(scheduler.active_count(), 0);
        assert!(sink.stopped().len() <= ids.len());
    }
}
