//! Speaker output: a small mixer rendering scheduled segments on a cpal stream.
//!
//! The sink clock is the number of frames the device has pulled, so segment
//! start times are sample-accurate relative to what has actually been played.
//! The callback owns the mixer outright; the sink talks to it through a queue.

use crate::audio::capture::{DeviceKind, SendableStream, find_device, with_suppressed_stderr};
use crate::audio::sink::{AudioSink, SegmentId, SinkSegment};
use crate::error::{ParleyError, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One segment inside the mixer.
#[derive(Debug)]
struct Voice {
    id: SegmentId,
    samples: Arc<[f32]>,
    start_frame: u64,
    position: f64,
    step: f64,
    gain: f32,
}

/// Sums active voices into an interleaved output buffer.
#[derive(Debug)]
pub(crate) struct Mixer {
    voices: Vec<Voice>,
    output_rate: u32,
}

impl Mixer {
    pub(crate) fn new(output_rate: u32) -> Self {
        Self {
            voices: Vec::new(),
            output_rate,
        }
    }

    pub(crate) fn add(&mut self, segment: SinkSegment) {
        let start_frame = (segment.start.max(0.0) * self.output_rate as f64).round() as u64;
        let step =
            segment.rate as f64 * segment.sample_rate as f64 / self.output_rate.max(1) as f64;
        self.voices.push(Voice {
            id: segment.id,
            samples: segment.samples,
            start_frame,
            position: 0.0,
            step,
            gain: segment.gain,
        });
    }

    pub(crate) fn remove(&mut self, id: SegmentId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|voice| voice.id != id);
        self.voices.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.voices.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.voices.len()
    }

    /// Render `out` (interleaved, `channels` wide) starting at `base_frame`.
    ///
    /// Returns the segments that played to their end during this block.
    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize, base_frame: u64) -> Vec<SegmentId> {
        out.fill(0.0);
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let mut finished = Vec::new();

        for voice in &mut self.voices {
            for frame in 0..frames {
                if base_frame + (frame as u64) < voice.start_frame {
                    continue;
                }
                let idx = voice.position as usize;
                let Some(&sample) = voice.samples.get(idx) else {
                    break;
                };
                let value = sample * voice.gain;
                for slot in &mut out[frame * channels..(frame + 1) * channels] {
                    *slot += value;
                }
                voice.position += voice.step;
            }
            if voice.position as usize >= voice.samples.len() {
                finished.push(voice.id);
            }
        }

        if !finished.is_empty() {
            self.voices.retain(|voice| !finished.contains(&voice.id));
        }
        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }
        finished
    }
}

/// Changes requested by the sink, applied by the callback before each block.
#[derive(Debug)]
pub(crate) enum MixerCommand {
    Add(SinkSegment),
    Stop(SegmentId),
    Clear,
}

/// Everything the audio callback owns. The callback never takes a lock:
/// segment changes arrive as commands and completions leave through a
/// bounded queue, with undelivered ids retried on the next block.
pub(crate) struct Renderer {
    mixer: Mixer,
    commands: Receiver<MixerCommand>,
    completions: Sender<SegmentId>,
    undelivered: VecDeque<SegmentId>,
    frames_rendered: Arc<AtomicU64>,
}

impl Renderer {
    pub(crate) fn new(
        output_rate: u32,
        commands: Receiver<MixerCommand>,
        completions: Sender<SegmentId>,
        frames_rendered: Arc<AtomicU64>,
    ) -> Self {
        Self {
            mixer: Mixer::new(output_rate),
            commands,
            completions,
            undelivered: VecDeque::new(),
            frames_rendered,
        }
    }

    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                MixerCommand::Add(segment) => self.mixer.add(segment),
                MixerCommand::Stop(id) => {
                    self.mixer.remove(id);
                }
                MixerCommand::Clear => self.mixer.clear(),
            }
        }

        let frames = (out.len() / channels.max(1)) as u64;
        let base = self.frames_rendered.load(Ordering::Acquire);
        let finished = self.mixer.render(out, channels, base);
        self.undelivered.extend(finished);
        self.deliver();
        self.frames_rendered.fetch_add(frames, Ordering::Release);
    }

    fn deliver(&mut self) {
        while let Some(&id) = self.undelivered.front() {
            match self.completions.try_send(id) {
                Ok(()) => {
                    self.undelivered.pop_front();
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Disconnected(_)) => {
                    self.undelivered.clear();
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_completions(&self) -> usize {
        self.undelivered.len()
    }
}

/// Output sink on a cpal device.
pub struct CpalAudioSink {
    device_name: String,
    output_rate: u32,
    commands: Sender<MixerCommand>,
    frames_rendered: Arc<AtomicU64>,
    stream: Mutex<Option<SendableStream>>,
    closed: AtomicBool,
}

impl CpalAudioSink {
    /// Open the named output device (or the best default) and start its stream.
    ///
    /// # Errors
    /// `ParleyError::DeviceUnavailable` if the device is missing or refuses a stream.
    pub fn open(device_name: Option<&str>, completions: Sender<SegmentId>) -> Result<Self> {
        let device = find_device(DeviceKind::Output, device_name)?;
        let device_name = device.name().unwrap_or_else(|_| "output".to_string());
        let unavailable = |message: String| ParleyError::device(device_name.clone(), message);

        let default_config = device
            .default_output_config()
            .map_err(|e| unavailable(format!("Failed to query default output config: {}", e)))?;
        let output_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        let (commands, command_rx) = crossbeam_channel::unbounded();
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let renderer = Renderer::new(
            output_rate,
            command_rx,
            completions,
            Arc::clone(&frames_rendered),
        );

        let err_callback = |err| {
            tracing::error!(error = %err, "audio output stream error");
        };

        let stream = with_suppressed_stderr(|| match default_config.sample_format() {
            cpal::SampleFormat::F32 => {
                let mut renderer = renderer;
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        renderer.render(data, channels);
                    },
                    err_callback,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let mut renderer = renderer;
                let mut scratch: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        renderer.render(&mut scratch, channels);
                        for (dst, src) in data.iter_mut().zip(&scratch) {
                            *dst = crate::audio::capture::f32_to_i16(*src);
                        }
                    },
                    err_callback,
                    None,
                )
            }
            _ => Err(cpal::BuildStreamError::StreamConfigNotSupported),
        })
        .map_err(|e| unavailable(format!("Failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| unavailable(format!("Failed to start output stream: {}", e)))?;

        tracing::debug!(
            device = %device_name,
            sample_rate = output_rate,
            channels,
            "audio output started"
        );

        Ok(Self {
            device_name,
            output_rate,
            commands,
            frames_rendered,
            stream: Mutex::new(Some(SendableStream(stream))),
            closed: AtomicBool::new(false),
        })
    }
}

impl AudioSink for CpalAudioSink {
    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.output_rate as f64
    }

    fn schedule(&self, segment: SinkSegment) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ParleyError::SinkRejection {
                message: format!("{} is closed", self.device_name),
            });
        }
        self.commands
            .send(MixerCommand::Add(segment))
            .map_err(|_| ParleyError::SinkRejection {
                message: format!("{} stopped rendering", self.device_name),
            })
    }

    fn stop(&self, id: SegmentId) {
        if self.commands.send(MixerCommand::Stop(id)).is_err() {
            tracing::debug!(%id, "output stream gone, nothing to stop");
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.commands.send(MixerCommand::Clear).is_err() {
            tracing::debug!("output stream already gone");
        }
        if let Ok(mut stream) = self.stream.lock()
            && let Some(sendable) = stream.take()
        {
            if let Err(e) = sendable.0.pause() {
                tracing::warn!(error = %e, "failed to pause output stream");
            }
            drop(sendable);
        }
        tracing::debug!(device = %self.device_name, "audio output closed");
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: u64, samples: Vec<f32>, start: f64, rate: f32, gain: f32) -> SinkSegment {
        SinkSegment {
            id: SegmentId::new(id),
            samples: samples.into(),
            sample_rate: 10,
            start,
            rate,
            gain,
        }
    }

    #[test]
    fn test_mixer_waits_for_start_frame() {
        let mut mixer = Mixer::new(10);
        mixer.add(segment(1, vec![0.5; 2], 0.3, 1.0, 1.0));

        let mut out = vec![0.0f32; 5];
        let finished = mixer.render(&mut out, 1, 0);

        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.5, 0.5]);
        assert_eq!(finished, vec![SegmentId::new(1)]);
        assert_eq!(mixer.len(), 0);
    }

    #[test]
    fn test_mixer_spans_blocks_and_duplicates_channels() {
        let mut mixer = Mixer::new(10);
        mixer.add(segment(1, vec![0.1, 0.2, 0.3], 0.0, 1.0, 1.0));

        let mut out = vec![0.0f32; 4];
        assert!(mixer.render(&mut out, 2, 0).is_empty());
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);

        let finished = mixer.render(&mut out, 2, 2);
        assert_eq!(out, vec![0.3, 0.3, 0.0, 0.0]);
        assert_eq!(finished, vec![SegmentId::new(1)]);
    }

    #[test]
    fn test_mixer_rate_and_gain() {
        let mut mixer = Mixer::new(10);
        mixer.add(segment(1, vec![0.1, 0.2, 0.3, 0.4], 0.0, 2.0, 2.0));

        let mut out = vec![0.0f32; 4];
        let finished = mixer.render(&mut out, 1, 0);

        assert!((out[0] - 0.2).abs() < 1e-6);
        assert!((out[1] - 0.6).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
        assert_eq!(finished.len(), 1);
    }

    #[test]
    fn test_mixer_clamps_sum() {
        let mut mixer = Mixer::new(10);
        mixer.add(segment(1, vec![0.8; 2], 0.0, 1.0, 1.0));
        mixer.add(segment(2, vec![0.8; 2], 0.0, 1.0, 1.0));

        let mut out = vec![0.0f32; 2];
        mixer.render(&mut out, 1, 0);
        assert_eq!(out, vec![1.0, 1.0]);
    }

    #[test]
    fn test_mixer_remove_stops_voice() {
        let mut mixer = Mixer::new(10);
        mixer.add(segment(1, vec![0.5; 10], 0.0, 1.0, 1.0));

        assert!(mixer.remove(SegmentId::new(1)));
        assert!(!mixer.remove(SegmentId::new(1)));

        let mut out = vec![0.0f32; 4];
        assert!(mixer.render(&mut out, 1, 0).is_empty());
        assert_eq!(out, vec![0.0; 4]);
    }

    fn renderer(
        completions: Sender<SegmentId>,
    ) -> (Sender<MixerCommand>, Arc<AtomicU64>, Renderer) {
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let frames = Arc::new(AtomicU64::new(0));
        let renderer = Renderer::new(10, command_rx, completions, Arc::clone(&frames));
        (commands, frames, renderer)
    }

    #[test]
    fn test_renderer_keeps_back_to_back_segments_contiguous() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let (commands, frames, mut renderer) = renderer(tx);
        commands
            .send(MixerCommand::Add(segment(1, vec![0.1; 3], 0.0, 1.0, 1.0)))
            .unwrap();

        let mut out = vec![0.0f32; 2];
        renderer.render(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.1]);

        // A segment queued mid-playback lands exactly where the first ends.
        commands
            .send(MixerCommand::Add(segment(2, vec![0.4; 2], 0.3, 1.0, 1.0)))
            .unwrap();
        let mut out = vec![0.0f32; 4];
        renderer.render(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.4, 0.4, 0.0]);
        assert_eq!(frames.load(Ordering::Acquire), 6);
    }

    #[test]
    fn test_renderer_applies_stop_and_clear() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (commands, _frames, mut renderer) = renderer(tx);
        commands
            .send(MixerCommand::Add(segment(1, vec![0.5; 10], 0.0, 1.0, 1.0)))
            .unwrap();
        commands
            .send(MixerCommand::Add(segment(2, vec![0.25; 10], 0.0, 1.0, 1.0)))
            .unwrap();

        let mut out = vec![0.0f32; 2];
        renderer.render(&mut out, 1);
        assert_eq!(out, vec![0.75, 0.75]);

        commands.send(MixerCommand::Stop(SegmentId::new(1))).unwrap();
        renderer.render(&mut out, 1);
        assert_eq!(out, vec![0.25, 0.25]);

        commands.send(MixerCommand::Clear).unwrap();
        renderer.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_renderer_retries_completions_when_queue_full() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let (commands, _frames, mut renderer) = renderer(tx);
        for id in 1..=3 {
            commands
                .send(MixerCommand::Add(segment(id, vec![0.1], 0.0, 1.0, 1.0)))
                .unwrap();
        }

        let mut out = vec![0.0f32; 2];
        renderer.render(&mut out, 1);
        assert_eq!(renderer.pending_completions(), 2);
        assert_eq!(rx.try_recv().unwrap(), SegmentId::new(1));

        renderer.render(&mut out, 1);
        assert_eq!(rx.try_recv().unwrap(), SegmentId::new(2));
        renderer.render(&mut out, 1);
        assert_eq!(rx.try_recv().unwrap(), SegmentId::new(3));
        assert_eq!(renderer.pending_completions(), 0);
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_cpal_sink_clock_advances() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let sink = CpalAudioSink::open(None, tx).expect("Failed to open output");
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(sink.now() > 0.0);
        sink.close();
        sink.close();
    }
}
