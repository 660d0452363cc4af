//! Playback scheduling of decoded response audio.

pub mod arena;
pub mod scheduler;

pub use arena::{PlaybackSegment, SegmentArena};
pub use scheduler::{PlaybackLimits, PlaybackScheduler};
