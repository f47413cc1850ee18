//! Wire format conversion between normalized PCM and the transport payload.
//!
//! Outbound: float frames are quantized to signed 16-bit little-endian,
//! base64-encoded, and wrapped in the `{ "media": ... }` message the remote
//! service ingests. Inbound: the service streams base64 pcm16 at a fixed
//! rate; decoding is CPU-bound byte work and runs on `DecodeWorker`'s
//! thread so neither the UI nor an audio callback pays for it.
//!
//! Quantization rounds half away from zero (`f32::round`), so 0.5 maps to
//! 16384 and -0.5 to -16384.

use crate::chunker::AudioFrame;
use crate::error::{DecodeError, EncodeError};
use crate::playback::PlaybackScheduler;
use crate::resample;
use crate::session::PipelineEvent;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub const WIRE_FORMAT: &str = "pcm16";

/// One encoded capture frame plus the metadata the service needs to
/// interpret it without a per-chunk handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedChunk {
    pub data: String,
    #[serde(rename = "sampleRateHz")]
    pub sample_rate_hz: u32,
    pub format: String,
}

#[derive(Serialize)]
struct MediaMessage<'a> {
    media: &'a EncodedChunk,
}

impl EncodedChunk {
    /// The outbound message envelope: `{ "media": { ... } }`.
    pub fn to_message_json(&self) -> serde_json::Value {
        serde_json::to_value(MediaMessage { media: self }).unwrap_or_default()
    }
}

/// Decoded translated audio, owned by the playback scheduler from decode
/// until playback completes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudioBuffer {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate.max(1))
    }
}

/// Quantize a frame to pcm16le and base64-wrap it. Out-of-range samples
/// clamp; an empty frame is rejected.
pub fn encode_frame(frame: &AudioFrame) -> Result<EncodedChunk, EncodeError> {
    if frame.samples.is_empty() {
        return Err(EncodeError::EmptyFrame);
    }
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        let quantized = (sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }
    Ok(EncodedChunk {
        data: BASE64.encode(&bytes),
        sample_rate_hz: frame.sample_rate,
        format: WIRE_FORMAT.to_string(),
    })
}

/// Reconstruct float samples from a base64 pcm16le payload.
pub fn decode_payload(
    payload: &[u8],
    sample_rate: u32,
) -> Result<DecodedAudioBuffer, DecodeError> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::TruncatedPcm(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect();
    Ok(DecodedAudioBuffer {
        samples,
        sample_rate,
    })
}

/// Background decoder keeping base64/PCM work off the latency-critical
/// paths. A single thread consumes payloads in arrival order, so decoded
/// buffers reach the scheduler strictly FIFO. A malformed payload is
/// dropped with a reported warning; the stream continues.
pub struct DecodeWorker {
    sender: Option<Sender<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
    dropped: Arc<AtomicUsize>,
}

impl DecodeWorker {
    pub fn spawn(
        scheduler: Arc<PlaybackScheduler>,
        service_rate: u32,
        events: Sender<PipelineEvent>,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = bounded::<Vec<u8>>(capacity.max(1));
        let handle = thread::spawn(move || {
            let device_rate = scheduler.sample_rate();
            for payload in rx.iter() {
                match decode_payload(&payload, service_rate) {
                    Ok(buffer) => {
                        // Streaming path: decoded buffers play back-to-back,
                        // so the per-chunk sinc resampler is unsuitable here.
                        let samples =
                            resample::resample_stream(&buffer.samples, service_rate, device_rate);
                        scheduler.submit(DecodedAudioBuffer {
                            samples,
                            sample_rate: device_rate,
                        });
                    }
                    Err(err) => {
                        log::warn!("dropping inbound chunk: {err}");
                        let _ = events.try_send(PipelineEvent::DecodeError(err.to_string()));
                    }
                }
            }
        });
        Self {
            sender: Some(tx),
            handle: Some(handle),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hand off one inbound payload. Never blocks; a full queue drops the
    /// chunk and counts it.
    pub fn submit(&self, payload: Vec<u8>) {
        let Some(sender) = &self.sender else { return };
        match sender.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("decode queue full; dropping inbound chunk");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain its queue and exit.
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: Vec<f32>) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate: 16_000,
        }
    }

    fn decode_i16(chunk: &EncodedChunk) -> Vec<i16> {
        BASE64
            .decode(&chunk.data)
            .unwrap()
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect()
    }

    #[test]
    fn encodes_documented_example_frame() {
        let chunk = encode_frame(&frame(vec![0.5, -0.5, 0.0, 1.0])).unwrap();
        assert_eq!(decode_i16(&chunk), vec![16_384, -16_384, 0, 32_767]);
        assert_eq!(chunk.sample_rate_hz, 16_000);
        assert_eq!(chunk.format, "pcm16");
    }

    #[test]
    fn out_of_range_samples_clamp_instead_of_failing() {
        let chunk = encode_frame(&frame(vec![4.0, -4.0])).unwrap();
        assert_eq!(decode_i16(&chunk), vec![32_767, -32_767]);
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert_eq!(
            encode_frame(&frame(Vec::new())),
            Err(EncodeError::EmptyFrame)
        );
    }

    #[test]
    fn silence_round_trips_exactly() {
        let chunk = encode_frame(&frame(vec![0.0; 64])).unwrap();
        let decoded = decode_payload(chunk.data.as_bytes(), 16_000).unwrap();
        assert_eq!(decoded.samples, vec![0.0; 64]);
    }

    #[test]
    fn full_scale_round_trips_within_one_quantization_step() {
        let chunk = encode_frame(&frame(vec![1.0, -1.0])).unwrap();
        let decoded = decode_payload(chunk.data.as_bytes(), 16_000).unwrap();
        assert!((decoded.samples[0] - 1.0).abs() <= 1.0 / 32_768.0);
        assert!((decoded.samples[1] + 1.0).abs() <= 1.0 / 32_768.0);
    }

    #[test]
    fn example_frame_round_trips_within_quantization_error() {
        let original = vec![0.5, -0.5, 0.0, 1.0];
        let chunk = encode_frame(&frame(original.clone())).unwrap();
        let decoded = decode_payload(chunk.data.as_bytes(), 16_000).unwrap();
        for (a, b) in original.iter().zip(&decoded.samples) {
            assert!((a - b).abs() <= 1.0 / 32_768.0, "{a} vs {b}");
        }
    }

    #[test]
    fn invalid_base64_is_a_decode_error() {
        let err = decode_payload(b"@@not-base64@@", 24_000).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidBase64(_)));
    }

    #[test]
    fn odd_byte_count_is_a_decode_error() {
        let payload = BASE64.encode([0u8, 1, 2]);
        let err = decode_payload(payload.as_bytes(), 24_000).unwrap_err();
        assert_eq!(err, DecodeError::TruncatedPcm(3));
    }

    #[test]
    fn media_message_has_expected_shape() {
        let chunk = encode_frame(&frame(vec![0.25; 4])).unwrap();
        let msg = chunk.to_message_json();
        assert_eq!(msg["media"]["sampleRateHz"], 16_000);
        assert_eq!(msg["media"]["format"], "pcm16");
        assert_eq!(msg["media"]["data"], chunk.data);
    }

    #[test]
    fn decoded_buffer_reports_duration() {
        let buffer = DecodedAudioBuffer {
            samples: vec![0.0; 24_000],
            sample_rate: 24_000,
        };
        assert!((buffer.duration_secs() - 1.0).abs() < 1e-9);
    }
}
