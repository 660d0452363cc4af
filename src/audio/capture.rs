//! Microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::source::AudioSource;
use crate::defaults;
use crate::error::{ParleyError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Longest stretch of audio held between two polls (2 s at 16 kHz).
/// Older samples are discarded if the capture thread stalls.
const MAX_BUFFERED_SAMPLES: usize = defaults::CAPTURE_SAMPLE_RATE as usize * 2;

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for a voice conversation.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// Which side of the audio host to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceKind {
    Input,
    Output,
}

impl DeviceKind {
    fn label(self) -> &'static str {
        match self {
            DeviceKind::Input => "input",
            DeviceKind::Output => "output",
        }
    }
}

fn enumerate(host: &cpal::Host, kind: DeviceKind) -> Result<Vec<cpal::Device>> {
    let devices = match kind {
        DeviceKind::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        DeviceKind::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
    };
    devices.map_err(|e| {
        ParleyError::device(
            kind.label(),
            format!("Failed to enumerate {} devices: {}", kind.label(), e),
        )
    })
}

fn list_devices(kind: DeviceKind) -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        enumerate(&host, kind)
    })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                device_names.push(format!("{} [recommended]", name));
            } else {
                device_names.push(name);
            }
        }
    }
    Ok(device_names)
}

/// List usable microphones; preferred devices are marked "\[recommended\]".
pub fn list_input_devices() -> Result<Vec<String>> {
    list_devices(DeviceKind::Input)
}

/// List usable speakers; preferred devices are marked "\[recommended\]".
pub fn list_output_devices() -> Result<Vec<String>> {
    list_devices(DeviceKind::Output)
}

/// Find a device by exact name, or the best default (PipeWire, Pulse, then system default).
pub(crate) fn find_device(kind: DeviceKind, name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Some(wanted) = name {
            return enumerate(&host, kind)?
                .into_iter()
                .find(|dev| dev.name().is_ok_and(|n| n == wanted))
                .ok_or_else(|| ParleyError::device(wanted, "no such device"));
        }

        for device in enumerate(&host, kind).unwrap_or_default() {
            if device.name().is_ok_and(|n| is_preferred_device(&n)) {
                return Ok(device);
            }
        }

        let fallback = match kind {
            DeviceKind::Input => host.default_input_device(),
            DeviceKind::Output => host.default_output_device(),
        };
        fallback.ok_or_else(|| {
            ParleyError::device("default", format!("no {} device available", kind.label()))
        })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through the owning Mutex, one thread at
/// a time, and never from inside its own data callback.
pub(crate) struct SendableStream(pub(crate) cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone capture at 16kHz mono i16.
///
/// Tries the preferred format first (i16/16kHz/mono), then f32, then the
/// device's native config with software conversion.
pub struct CpalAudioSource {
    device: cpal::Device,
    device_name: String,
    stream: Arc<Mutex<Option<SendableStream>>>,
    buffer: Arc<Mutex<Vec<i16>>>,
    callback_count: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalAudioSource {
    /// Create a capture source for the named device, or the best default.
    ///
    /// # Errors
    /// `ParleyError::DeviceUnavailable` if the device does not exist.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = find_device(DeviceKind::Input, device_name)?;
        let device_name = device.name().unwrap_or_else(|_| "input".to_string());

        Ok(Self {
            device,
            device_name,
            stream: Arc::new(Mutex::new(None)),
            buffer: Arc::new(Mutex::new(Vec::new())),
            callback_count: Arc::new(AtomicU64::new(0)),
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
        })
    }

    fn unavailable(&self, message: String) -> ParleyError {
        ParleyError::device(self.device_name.clone(), message)
    }

    fn push_samples(buffer: &Mutex<Vec<i16>>, samples: &[i16]) {
        if let Ok(mut buf) = buffer.lock() {
            buf.extend_from_slice(samples);
            if buf.len() > MAX_BUFFERED_SAMPLES {
                let excess = buf.len() - MAX_BUFFERED_SAMPLES;
                buf.drain(..excess);
            }
        }
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err| {
            tracing::error!(error = %err, "audio capture stream error");
        };

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                Self::push_samples(&buffer, data);
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                counter.fetch_add(1, Ordering::Relaxed);
                let converted: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                Self::push_samples(&buffer, &converted);
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native()
    }

    /// Capture at the device's native config, mixing to mono and resampling in software.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config = self
            .device
            .default_input_config()
            .map_err(|e| self.unavailable(format!("Failed to query default input config: {}", e)))?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            channels = native_channels,
            sample_rate = native_rate,
            format = ?default_config.sample_format(),
            "using native capture format, converting in software"
        );

        let err_callback = |err| {
            tracing::error!(error = %err, "audio capture stream error");
        };
        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);

        let convert = move |mono_input: &[i16]| {
            let mono = crate::audio::wav::downmix(mono_input, native_channels);
            crate::audio::wav::resample(&mono, native_rate, target_rate)
        };

        match default_config.sample_format() {
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        Self::push_samples(&buffer, &convert(data));
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| self.unavailable(format!("Failed to build native i16 stream: {}", e))),
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        let i16_data: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                        Self::push_samples(&buffer, &convert(&i16_data));
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| self.unavailable(format!("Failed to build native f32 stream: {}", e))),
            fmt => Err(self.unavailable(format!("Unsupported native sample format: {:?}", fmt))),
        }
    }
}

/// Map a float sample in [-1, 1] to i16.
pub(crate) fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        {
            let stream_guard = self
                .stream
                .lock()
                .map_err(|e| self.unavailable(format!("Failed to lock stream: {}", e)))?;
            if stream_guard.is_some() {
                return Ok(());
            }
        }

        let stream = self.build_stream()?;
        stream
            .play()
            .map_err(|e| self.unavailable(format!("Failed to start audio stream: {}", e)))?;

        // Some PipeWire-ALSA setups accept non-native configs but never deliver data.
        std::thread::sleep(std::time::Duration::from_millis(200));

        let final_stream = if self.callback_count.load(Ordering::Relaxed) == 0 {
            drop(stream);
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
            let native_stream = self.build_stream_native()?;
            native_stream.play().map_err(|e| {
                self.unavailable(format!("Failed to start native audio stream: {}", e))
            })?;
            native_stream
        } else {
            stream
        };

        let mut stream_guard = self
            .stream
            .lock()
            .map_err(|e| self.unavailable(format!("Failed to lock stream: {}", e)))?;
        *stream_guard = Some(SendableStream(final_stream));
        tracing::debug!(device = %self.device_name, "audio capture started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut stream_guard = self
            .stream
            .lock()
            .map_err(|e| ParleyError::Other(format!("Failed to lock stream: {}", e)))?;

        // Dropping the stream releases the device.
        if let Some(sendable_stream) = stream_guard.take() {
            if let Err(e) = sendable_stream.0.pause() {
                tracing::warn!(error = %e, "failed to pause capture stream");
            }
            drop(sendable_stream);
            tracing::debug!(device = %self.device_name, "audio capture stopped");
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|e| ParleyError::Other(format!("Failed to lock audio buffer: {}", e)))?;
        Ok(std::mem::take(&mut *buffer))
    }
}
