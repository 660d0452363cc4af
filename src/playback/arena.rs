//! Arena of in-flight playback segments addressed by `SegmentId`.

use crate::audio::sink::SegmentId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Decoded audio owned by the scheduler from enqueue until it ends or is stopped.
#[derive(Debug, Clone)]
pub struct PlaybackSegment {
    pub id: SegmentId,
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// Start time on the sink clock, in seconds.
    pub scheduled_start: f64,
    pub rate: f32,
    pub gain: f32,
}

impl PlaybackSegment {
    /// Length at the applied rate.
    pub fn effective_duration(&self) -> f64 {
        if self.sample_rate == 0 || self.rate <= 0.0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64 / self.rate as f64
    }

    pub fn scheduled_end(&self) -> f64 {
        self.scheduled_start + self.effective_duration()
    }
}

/// Active segments in id (enqueue) order. Ids are never reused.
#[derive(Debug, Default)]
pub struct SegmentArena {
    segments: BTreeMap<SegmentId, PlaybackSegment>,
    next_id: u64,
}

impl SegmentArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the id for the next segment.
    pub fn allocate(&mut self) -> SegmentId {
        let id = SegmentId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, segment: PlaybackSegment) {
        self.segments.insert(segment.id, segment);
    }

    pub fn remove(&mut self, id: SegmentId) -> Option<PlaybackSegment> {
        self.segments.remove(&id)
    }

    /// Take every segment out, oldest first.
    pub fn drain(&mut self) -> Vec<PlaybackSegment> {
        std::mem::take(&mut self.segments).into_values().collect()
    }

    pub fn contains(&self, id: SegmentId) -> bool {
        self.segments.contains_key(&id)
    }

    pub fn get(&self, id: SegmentId) -> Option<&PlaybackSegment> {
        self.segments.get(&id)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
