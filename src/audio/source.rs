use crate::error::{ParleyError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Trait for audio capture devices.
///
/// This trait allows swapping implementations (real audio device, WAV file, mock).
/// Samples are 16 kHz mono 16-bit PCM.
pub trait AudioSource: Send {
    /// Acquire the device and start capturing.
    ///
    /// # Errors
    /// `ParleyError::DeviceUnavailable` if access is denied or already held.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing and release the device.
    fn stop(&mut self) -> Result<()>;

    /// Read the samples captured since the last call (may be empty).
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Whether the source ends on its own (file) rather than running until stopped (mic).
    fn is_finite(&self) -> bool {
        false
    }
}

/// Shared view of a `MockAudioSource` that survives the source being moved
/// into the capture thread.
#[derive(Debug, Default)]
struct MockSourceState {
    started: AtomicBool,
    starts: AtomicU32,
    stops: AtomicU32,
    reads: AtomicU32,
}

/// Observer handle for a `MockAudioSource`.
#[derive(Debug, Clone)]
pub struct MockSourceMonitor(Arc<MockSourceState>);

impl MockSourceMonitor {
    pub fn is_started(&self) -> bool {
        self.0.started.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> u32 {
        self.0.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u32 {
        self.0.stops.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u32 {
        self.0.reads.load(Ordering::SeqCst)
    }
}

/// Mock audio source for testing
#[derive(Debug)]
pub struct MockAudioSource {
    state: Arc<MockSourceState>,
    samples: Vec<i16>,
    max_reads: Option<u32>,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
}

impl MockAudioSource {
    /// Create a new mock audio source that yields 160 zero samples per read, forever.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockSourceState::default()),
            samples: vec![0i16; 160],
            max_reads: None,
            should_fail_start: false,
            should_fail_read: false,
            error_message: "mock audio error".to_string(),
        }
    }

    /// Configure the mock to return specific samples on every read
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Make the source finite: after `reads` non-empty reads it returns empty.
    pub fn with_reads(mut self, reads: u32) -> Self {
        self.max_reads = Some(reads);
        self
    }

    /// Configure the mock to fail on start (device unavailable)
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Configure the mock to fail on read
    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    /// Configure the error message for failures
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Observer for start/stop/read activity.
    pub fn monitor(&self) -> MockSourceMonitor {
        MockSourceMonitor(Arc::clone(&self.state))
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(ParleyError::device("mock input", self.error_message.clone()));
        }
        self.state.started.store(true, Ordering::SeqCst);
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.started.store(false, Ordering::SeqCst);
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            return Err(ParleyError::Other(self.error_message.clone()));
        }
        let count = self.state.reads.fetch_add(1, Ordering::SeqCst);
        match self.max_reads {
            Some(max) if count >= max => Ok(Vec::new()),
            _ => Ok(self.samples.clone()),
        }
    }

    fn is_finite(&self) -> bool {
        self.max_reads.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_audio_source_returns_configured_samples() {
        let test_samples = vec![100i16, 200, 300, 400, 500];
        let mut source = MockAudioSource::new().with_samples(test_samples.clone());

        assert_eq!(source.read_samples().unwrap(), test_samples);
        assert!(!source.is_finite());
    }

    #[test]
    fn test_mock_audio_source_finite_reads_then_empty() {
        let mut source = MockAudioSource::new().with_reads(2);
        assert!(source.is_finite());

        assert_eq!(source.read_samples().unwrap().len(), 160);
        assert_eq!(source.read_samples().unwrap().len(), 160);
        assert!(source.read_samples().unwrap().is_empty());
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn test_mock_audio_source_start_failure_is_device_unavailable() {
        let mut source = MockAudioSource::new()
            .with_start_failure()
            .with_error_message("permission denied");

        match source.start() {
            Err(ParleyError::DeviceUnavailable { message, .. }) => {
                assert_eq!(message, "permission denied");
            }
            other => panic!("Expected DeviceUnavailable, got {:?}", other),
        }
        assert!(!source.monitor().is_started());
    }

    #[test]
    fn test_mock_audio_source_read_failure() {
        let mut source = MockAudioSource::new().with_read_failure();
        assert!(source.read_samples().is_err());
    }

    #[test]
    fn test_monitor_tracks_lifecycle_after_move() {
        let mut source = MockAudioSource::new();
        let monitor = source.monitor();

        source.start().unwrap();
        assert!(monitor.is_started());

        let mut boxed: Box<dyn AudioSource> = Box::new(source);
        boxed.read_samples().unwrap();
        boxed.stop().unwrap();

        assert!(!monitor.is_started());
        assert_eq!(monitor.start_count(), 1);
        assert_eq!(monitor.stop_count(), 1);
        assert_eq!(monitor.read_count(), 1);
    }
}
