//! Device provider: hands out the input source and output sink for one session.
//!
//! Each side is exclusive. A second open while the first handle is still
//! alive fails with `DeviceUnavailable`; dropping the handle releases it.

use crate::audio::sink::{AudioSink, ManualSink, SegmentId, SinkSegment};
use crate::audio::source::{AudioSource, MockAudioSource};
use crate::error::{ParleyError, Result};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Opens the devices a session needs.
pub trait DeviceProvider: Send + Sync {
    /// Acquire the capture device.
    fn open_input(&self) -> Result<Box<dyn AudioSource>>;

    /// Acquire the playback device; completions are reported on `completions`.
    fn open_output(&self, completions: Sender<SegmentId>) -> Result<Arc<dyn AudioSink>>;
}

/// Exclusive claim on one device side, released on drop.
#[derive(Debug)]
struct Hold {
    flag: Arc<AtomicBool>,
    open_handles: Arc<AtomicUsize>,
}

impl Hold {
    fn acquire(flag: &Arc<AtomicBool>, open_handles: &Arc<AtomicUsize>, device: &str) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ParleyError::device(device, "already held by another session"));
        }
        open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            flag: Arc::clone(flag),
            open_handles: Arc::clone(open_handles),
        })
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Holds {
    input: Arc<AtomicBool>,
    output: Arc<AtomicBool>,
    open_handles: Arc<AtomicUsize>,
}

impl Holds {
    fn input(&self, device: &str) -> Result<Hold> {
        Hold::acquire(&self.input, &self.open_handles, device)
    }

    fn output(&self, device: &str) -> Result<Hold> {
        Hold::acquire(&self.output, &self.open_handles, device)
    }
}

struct HeldSource {
    inner: Box<dyn AudioSource>,
    _hold: Hold,
}

impl AudioSource for HeldSource {
    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.stop()
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        self.inner.read_samples()
    }

    fn is_finite(&self) -> bool {
        self.inner.is_finite()
    }
}

struct HeldSink {
    inner: Arc<dyn AudioSink>,
    hold: Mutex<Option<Hold>>,
}

impl AudioSink for HeldSink {
    fn now(&self) -> f64 {
        self.inner.now()
    }

    fn schedule(&self, segment: SinkSegment) -> Result<()> {
        self.inner.schedule(segment)
    }

    fn stop(&self, id: SegmentId) {
        self.inner.stop(id)
    }

    fn close(&self) {
        self.inner.close();
        if let Ok(mut hold) = self.hold.lock() {
            hold.take();
        }
    }
}

/// Real devices through cpal.
#[cfg(feature = "cpal-audio")]
#[derive(Debug, Default)]
pub struct CpalDevices {
    input_device: Option<String>,
    output_device: Option<String>,
    holds: Holds,
}

#[cfg(feature = "cpal-audio")]
impl CpalDevices {
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
            holds: Holds::default(),
        }
    }
}

#[cfg(feature = "cpal-audio")]
impl DeviceProvider for CpalDevices {
    fn open_input(&self) -> Result<Box<dyn AudioSource>> {
        let name = self.input_device.as_deref().unwrap_or("default input");
        let hold = self.holds.input(name)?;
        let source = crate::audio::capture::CpalAudioSource::new(self.input_device.as_deref())?;
        Ok(Box::new(HeldSource {
            inner: Box::new(source),
            _hold: hold,
        }))
    }

    fn open_output(&self, completions: Sender<SegmentId>) -> Result<Arc<dyn AudioSink>> {
        let name = self.output_device.as_deref().unwrap_or("default output");
        let hold = self.holds.output(name)?;
        let sink = crate::audio::output::CpalAudioSink::open(self.output_device.as_deref(), completions)?;
        Ok(Arc::new(HeldSink {
            inner: Arc::new(sink),
            hold: Mutex::new(Some(hold)),
        }))
    }
}

/// Capture from a WAV file, play through a provider's output.
pub struct WavDevices<P> {
    path: std::path::PathBuf,
    output: P,
    holds: Holds,
}

impl<P: DeviceProvider> WavDevices<P> {
    pub fn new(path: impl Into<std::path::PathBuf>, output: P) -> Self {
        Self {
            path: path.into(),
            output,
            holds: Holds::default(),
        }
    }
}

impl<P: DeviceProvider> DeviceProvider for WavDevices<P> {
    fn open_input(&self) -> Result<Box<dyn AudioSource>> {
        let hold = self.holds.input(&self.path.display().to_string())?;
        let source = crate::audio::wav::WavAudioSource::from_path(&self.path)?;
        Ok(Box::new(HeldSource {
            inner: Box::new(source),
            _hold: hold,
        }))
    }

    fn open_output(&self, completions: Sender<SegmentId>) -> Result<Arc<dyn AudioSink>> {
        self.output.open_output(completions)
    }
}

/// In-memory devices for tests.
///
/// The input is a `MockAudioSource` built by a factory; the output is a
/// `ManualSink` reachable through `sink()` after it is opened.
pub struct MockDevices {
    source_factory: Box<dyn Fn() -> MockAudioSource + Send + Sync>,
    fail_input: Option<String>,
    fail_output: Option<String>,
    sink: Mutex<Option<Arc<ManualSink>>>,
    holds: Holds,
}

impl MockDevices {
    /// Input yields 160 zero samples per read until stopped.
    pub fn new() -> Self {
        Self {
            source_factory: Box::new(MockAudioSource::new),
            fail_input: None,
            fail_output: None,
            sink: Mutex::new(None),
            holds: Holds::default(),
        }
    }

    pub fn with_source(mut self, factory: impl Fn() -> MockAudioSource + Send + Sync + 'static) -> Self {
        self.source_factory = Box::new(factory);
        self
    }

    /// Make `open_input` fail with `DeviceUnavailable`.
    pub fn with_input_failure(mut self, message: &str) -> Self {
        self.fail_input = Some(message.to_string());
        self
    }

    /// Make `open_output` fail with `DeviceUnavailable`.
    pub fn with_output_failure(mut self, message: &str) -> Self {
        self.fail_output = Some(message.to_string());
        self
    }

    /// The most recently opened sink.
    pub fn sink(&self) -> Option<Arc<ManualSink>> {
        self.sink.lock().ok().and_then(|sink| sink.clone())
    }

    /// Input and output handles currently held.
    pub fn open_handles(&self) -> usize {
        self.holds.open_handles.load(Ordering::SeqCst)
    }
}

impl Default for MockDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProvider for MockDevices {
    fn open_input(&self) -> Result<Box<dyn AudioSource>> {
        if let Some(message) = &self.fail_input {
            return Err(ParleyError::device("mock input", message.clone()));
        }
        let hold = self.holds.input("mock input")?;
        Ok(Box::new(HeldSource {
            inner: Box::new((self.source_factory)()),
            _hold: hold,
        }))
    }

    fn open_output(&self, completions: Sender<SegmentId>) -> Result<Arc<dyn AudioSink>> {
        if let Some(message) = &self.fail_output {
            return Err(ParleyError::device("mock output", message.clone()));
        }
        let hold = self.holds.output("mock output")?;
        let sink = Arc::new(ManualSink::new().with_completions(completions));
        if let Ok(mut slot) = self.sink.lock() {
            *slot = Some(Arc::clone(&sink));
        }
        Ok(Arc::new(HeldSink {
            inner: sink,
            hold: Mutex::new(Some(hold)),
        }))
    }
}
