//! Device I/O: microphone capture, framing and scheduled speaker output.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod devices;
pub mod framer;
#[cfg(feature = "cpal-audio")]
pub mod output;
pub mod sink;
pub mod source;
pub mod wav;

#[cfg(feature = "cpal-audio")]
pub use capture::{CpalAudioSource, list_input_devices, list_output_devices};
#[cfg(feature = "cpal-audio")]
pub use devices::CpalDevices;
pub use devices::{DeviceProvider, MockDevices, WavDevices};
pub use framer::{AudioFrame, CaptureFramer, FrameStream, FramerConfig, calculate_rms};
#[cfg(feature = "cpal-audio")]
pub use output::CpalAudioSink;
pub use sink::{AudioSink, ManualSink, SegmentId, SinkSegment};
pub use source::{AudioSource, MockAudioSource, MockSourceMonitor};
pub use wav::WavAudioSource;
