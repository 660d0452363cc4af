//! WAV file audio source: replays a recording as if it were a microphone.

use crate::audio::source::AudioSource;
use crate::defaults::CAPTURE_SAMPLE_RATE;
use crate::error::{ParleyError, Result};
use std::io::Read;
use std::path::Path;

/// Audio source that reads from WAV file data.
/// Supports arbitrary sample rates and channels, resampling to 16kHz mono.
pub struct WavAudioSource {
    samples: Vec<i16>,
    position: usize,
    chunk_size: usize,
}

impl WavAudioSource {
    /// Create from any reader.
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Result<Self> {
        let mut wav_reader = hound::WavReader::new(reader)
            .map_err(|e| ParleyError::device("wav", format!("Failed to parse WAV file: {}", e)))?;

        let spec = wav_reader.spec();
        let source_rate = spec.sample_rate;
        let source_channels = spec.channels as usize;

        let raw_samples: Vec<i16> = wav_reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                ParleyError::device("wav", format!("Failed to read WAV samples: {}", e))
            })?;

        let mono_samples = downmix(&raw_samples, source_channels);

        let samples = if source_rate != CAPTURE_SAMPLE_RATE {
            resample(&mono_samples, source_rate, CAPTURE_SAMPLE_RATE)
        } else {
            mono_samples
        };

        // 100ms chunks at 16kHz
        let chunk_size = (CAPTURE_SAMPLE_RATE / 10) as usize;

        Ok(Self {
            samples,
            position: 0,
            chunk_size,
        })
    }

    /// Open a WAV file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            ParleyError::device(path.display().to_string(), format!("Failed to open: {}", e))
        })?;
        Self::from_reader(Box::new(std::io::BufReader::new(file)))
    }

    /// Total number of samples after conversion.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl AudioSource for WavAudioSource {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.position >= self.samples.len() {
            return Ok(Vec::new());
        }

        let end = std::cmp::min(self.position + self.chunk_size, self.samples.len());
        let chunk = self.samples[self.position..end].to_vec();
        self.position = end;

        Ok(chunk)
    }

    fn is_finite(&self) -> bool {
        true
    }
}

/// Mix interleaved multi-channel audio to mono by averaging channels.
pub(crate) fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Simple linear interpolation resampling.
pub(crate) fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn from_reader_16khz_mono_matches_exactly() {
        let input_samples = vec![100i16, 200, 300, 400, 500];
        let wav_data = make_wav_data(16000, 1, &input_samples);

        let source = WavAudioSource::from_reader(Box::new(Cursor::new(wav_data))).unwrap();

        assert_eq!(source.samples, input_samples);
        assert_eq!(source.chunk_size, 1600);
        assert!(source.is_finite());
    }

    #[test]
    fn from_reader_stereo_downmixes_to_mono() {
        let stereo_samples = vec![100i16, 200, 300, 400, 500, 600];
        let wav_data = make_wav_data(16000, 2, &stereo_samples);

        let source = WavAudioSource::from_reader(Box::new(Cursor::new(wav_data))).unwrap();

        assert_eq!(source.samples, vec![150i16, 350, 550]);
    }

    #[test]
    fn from_reader_48khz_resamples_to_16khz() {
        let input_samples = vec![0i16; 48000];
        let wav_data = make_wav_data(48000, 1, &input_samples);

        let source = WavAudioSource::from_reader(Box::new(Cursor::new(wav_data))).unwrap();

        assert!(source.len() >= 15900 && source.len() <= 16100);
    }

    #[test]
    fn read_samples_chunks_then_empty_at_eof() {
        let wav_data = make_wav_data(16000, 1, &vec![1i16; 2000]);
        let mut source = WavAudioSource::from_reader(Box::new(Cursor::new(wav_data))).unwrap();

        assert_eq!(source.read_samples().unwrap().len(), 1600);
        assert_eq!(source.read_samples().unwrap().len(), 400);
        assert!(source.read_samples().unwrap().is_empty());
    }

    #[test]
    fn invalid_wav_data_is_device_unavailable() {
        let result = WavAudioSource::from_reader(Box::new(Cursor::new(vec![0u8, 1, 2, 3])));

        match result {
            Err(ParleyError::DeviceUnavailable { message, .. }) => {
                assert!(message.contains("Failed to parse WAV file"));
            }
            _ => panic!("Expected DeviceUnavailable error"),
        }
    }

    #[test]
    fn missing_file_is_device_unavailable() {
        let result = WavAudioSource::from_path(Path::new("/nonexistent/parley/input.wav"));
        assert!(matches!(
            result,
            Err(ParleyError::DeviceUnavailable { .. })
        ));
    }

    #[test]
    fn resample_upsample_interpolates() {
        let resampled = resample(&[0i16, 1000, 2000], 8000, 16000);

        assert_eq!(resampled.len(), 6);
        assert_eq!(resampled[0], 0);
        assert!(resampled[1] > 0 && resampled[1] < 1000);
        assert_eq!(resampled[2], 1000);
    }

    #[test]
    fn resample_handles_edge_cases() {
        assert!(resample(&[], 16000, 8000).is_empty());
        assert_eq!(resample(&[100i16], 16000, 8000), vec![100]);
        assert_eq!(resample(&[1i16, 2, 3], 16000, 16000), vec![1, 2, 3]);
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix(&[10, 20, 30, 40], 2), vec![15, 35]);
        assert_eq!(downmix(&[10, 20], 1), vec![10, 20]);
    }
}
