//! Microphone acquisition and the capture-side audio stream.
//!
//! Wraps the system input device so the session manager can ask for mono
//! float batches without touching cpal formats. Every supported sample type
//! is converted to `f32` up front and multi-channel input is downmixed, so
//! the chunker and meter stay format-agnostic. The callback does no network
//! or decode work; it feeds the level tap and the frame chunker and returns.

use crate::chunker::FrameChunker;
use crate::error::PipelineError;
use crate::meter::LevelTap;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::Arc;

/// List microphone names so the UI can expose a device picker.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().context("no input devices available")?;
    let mut names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

/// The resolved capture device.
pub struct InputDevice {
    device: cpal::Device,
}

impl InputDevice {
    /// Resolve the capture device, optionally forcing a specific one so
    /// users can pick the right microphone when several are exposed.
    pub fn open(preferred: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match preferred {
            Some(name) => {
                let mut devices = host.input_devices().context("no input devices available")?;
                devices
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| anyhow!("input device '{name}' not found"))?
            }
            None => host
                .default_input_device()
                .context("no default input device available")?,
        };
        Ok(Self { device })
    }

    pub fn name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }

    pub fn default_config(&self) -> Result<cpal::SupportedStreamConfig> {
        self.device
            .default_input_config()
            .context("failed to query input device config")
    }

    /// Build the input stream. The chunker is owned by the callback (single
    /// writer); samples also feed the input level tap, pre-resample.
    pub fn build_capture_stream(
        &self,
        config: &cpal::SupportedStreamConfig,
        mut chunker: FrameChunker,
        tap: Arc<LevelTap>,
    ) -> Result<cpal::Stream, PipelineError> {
        let stream_config: StreamConfig = config.clone().into();
        let channels = usize::from(stream_config.channels.max(1));
        let err_fn = |err| log::warn!("input stream error: {err}");

        let stream = match config.sample_format() {
            SampleFormat::F32 => {
                let mut scratch: Vec<f32> = Vec::new();
                self.device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _| {
                        scratch.clear();
                        append_downmixed_samples(&mut scratch, data, channels, |sample| sample);
                        tap.push(&scratch);
                        chunker.push(&scratch);
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut scratch: Vec<f32> = Vec::new();
                self.device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _| {
                        scratch.clear();
                        append_downmixed_samples(&mut scratch, data, channels, |sample| {
                            sample as f32 / 32_768.0
                        });
                        tap.push(&scratch);
                        chunker.push(&scratch);
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::U16 => {
                let mut scratch: Vec<f32> = Vec::new();
                self.device.build_input_stream(
                    &stream_config,
                    move |data: &[u16], _| {
                        scratch.clear();
                        append_downmixed_samples(&mut scratch, data, channels, |sample| {
                            (sample as f32 - 32_768.0) / 32_768.0
                        });
                        tap.push(&scratch);
                        chunker.push(&scratch);
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(PipelineError::DeviceAcquisition(format!(
                    "unsupported input sample format: {other:?}"
                )))
            }
        };

        stream.map_err(|e| PipelineError::DeviceAcquisition(e.to_string()))
    }
}

/// Downmix interleaved multi-channel input to mono while applying the
/// provided converter.
fn append_downmixed_samples<T, F>(buf: &mut Vec<f32>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmixes_stereo_to_mono() {
        let mut buf = Vec::new();
        let samples = [1.0f32, -1.0, 0.5, 0.5];
        append_downmixed_samples(&mut buf, &samples, 2, |sample| sample);
        assert_eq!(buf, vec![0.0, 0.5]);
    }

    #[test]
    fn preserves_mono_input() {
        let mut buf = Vec::new();
        let samples = [0.1f32, 0.2, 0.3];
        append_downmixed_samples(&mut buf, &samples, 1, |sample| sample);
        assert_eq!(buf, samples);
    }

    #[test]
    fn converts_i16_while_downmixing() {
        let mut buf = Vec::new();
        let samples = [16_384i16, -16_384];
        append_downmixed_samples(&mut buf, &samples, 2, |sample| sample as f32 / 32_768.0);
        assert_eq!(buf, vec![0.0]);
    }

    #[test]
    fn partial_trailing_frame_still_emits() {
        let mut buf = Vec::new();
        let samples = [0.4f32, 0.4, 0.8];
        append_downmixed_samples(&mut buf, &samples, 2, |sample| sample);
        assert_eq!(buf, vec![0.4, 0.8]);
    }
}
