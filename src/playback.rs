//! Gapless, strictly-ordered playback against a virtual device timeline.
//!
//! The scheduler owns two counters measured in whole samples at the output
//! device rate: `cursor`, advanced only by the output callback as the device
//! consumes audio, and `next_start`, the earliest sample at which the next
//! buffer may begin. Buffers queue back-to-back while audio arrives faster
//! than real time; if the pipeline falls behind, the next start re-syncs to
//! `cursor + lookahead` instead of scheduling in the past, so a stall costs
//! one bounded gap rather than compounding jitter.
//!
//! All timeline mutation happens under one mutex with the scheduler as the
//! single logical owner; the output callback only advances the cursor and
//! drains scheduled samples.

use crate::config::InterruptPolicy;
use crate::error::PipelineError;
use crate::meter::LevelTap;
use crate::wire::DecodedAudioBuffer;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, StreamConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct Scheduled {
    start: u64,
    offset: usize,
    samples: Vec<f32>,
}

struct Timeline {
    cursor: u64,
    next_start: u64,
    queue: VecDeque<Scheduled>,
}

pub struct PlaybackScheduler {
    state: Mutex<Timeline>,
    sample_rate: u32,
    lookahead: u64,
    policy: InterruptPolicy,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32, lookahead_samples: u64, policy: InterruptPolicy) -> Self {
        Self {
            state: Mutex::new(Timeline {
                cursor: 0,
                next_start: 0,
                queue: VecDeque::new(),
            }),
            sample_rate,
            lookahead: lookahead_samples,
            policy,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Schedule a decoded buffer. Returns the assigned start sample, or
    /// `None` if the buffer was malformed and dropped (timeline untouched).
    pub fn submit(&self, buffer: DecodedAudioBuffer) -> Option<u64> {
        if buffer.samples.is_empty() {
            log::warn!("dropping zero-length playback buffer");
            return None;
        }
        let mut state = self.lock();
        if state.next_start < state.cursor {
            // The pipeline fell behind; re-sync slightly ahead of the device
            // clock instead of scheduling in the past.
            state.next_start = state.cursor + self.lookahead;
        }
        let start = state.next_start;
        state.next_start += buffer.samples.len() as u64;
        state.queue.push_back(Scheduled {
            start,
            offset: 0,
            samples: buffer.samples,
        });
        Some(start)
    }

    /// React to the remote service's interruption signal: anything not yet
    /// started is stale, and the next buffer to arrive should start now.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        let cursor = state.cursor;
        match self.policy {
            InterruptPolicy::Resync => {
                // Keep the buffer already past its start time playing.
                state
                    .queue
                    .retain(|scheduled| scheduled.start <= cursor && scheduled.offset > 0);
            }
            InterruptPolicy::HardStop => {
                state.queue.clear();
            }
        }
        state.next_start = cursor;
    }

    /// Drop all scheduled audio and reset the timeline to the cursor.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.queue.clear();
        state.next_start = state.cursor;
    }

    /// Render mono samples for the output device and advance the cursor.
    /// Silence before a buffer's start, strict FIFO afterwards.
    pub fn fill(&self, out: &mut [f32]) {
        let mut state = self.lock();
        for slot in out.iter_mut() {
            while state
                .queue
                .front()
                .is_some_and(|front| front.offset >= front.samples.len())
            {
                state.queue.pop_front();
            }
            let t = state.cursor;
            let mut value = 0.0;
            if let Some(front) = state.queue.front_mut() {
                if front.start <= t {
                    value = front.samples[front.offset];
                    front.offset += 1;
                }
            }
            *slot = value;
            state.cursor += 1;
        }
        while state
            .queue
            .front()
            .is_some_and(|front| front.offset >= front.samples.len())
        {
            state.queue.pop_front();
        }
    }

    /// Device-clock position in samples.
    pub fn cursor_samples(&self) -> u64 {
        self.lock().cursor
    }

    /// Earliest sample the next buffer may start at.
    pub fn next_start_samples(&self) -> u64 {
        self.lock().next_start
    }

    /// Buffers scheduled but not yet fully played.
    pub fn pending_buffers(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// List output device names so the UI can expose a selector.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .context("no output devices available")?;
    let mut names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Resolve the output device, optionally by name.
pub fn open_output_device(preferred: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match preferred {
        Some(name) => {
            let mut devices = host
                .output_devices()
                .context("no output devices available")?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| anyhow!("output device '{name}' not found"))
        }
        None => host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device available")),
    }
}

/// Build the output stream that drains the scheduler. The callback renders
/// mono into a reused scratch buffer, feeds the output meter tap, and
/// interleaves into however many channels the device wants.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    scheduler: Arc<PlaybackScheduler>,
    tap: Arc<LevelTap>,
) -> Result<cpal::Stream, PipelineError> {
    let stream_config: StreamConfig = config.clone().into();
    let channels = usize::from(stream_config.channels.max(1));
    let err_fn = |err| log::warn!("output stream error: {err}");

    let stream = match config.sample_format() {
        SampleFormat::F32 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _| {
                    render(&scheduler, &tap, &mut scratch, data, channels, |v| v);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _| {
                    render(&scheduler, &tap, &mut scratch, data, channels, |v| {
                        (v.clamp(-1.0, 1.0) * 32_767.0) as i16
                    });
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [u16], _| {
                    render(&scheduler, &tap, &mut scratch, data, channels, |v| {
                        ((v.clamp(-1.0, 1.0) * 0.5 + 0.5) * 65_535.0) as u16
                    });
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(PipelineError::DeviceAcquisition(format!(
                "unsupported output sample format: {other:?}"
            )))
        }
    };

    stream.map_err(|e| PipelineError::DeviceAcquisition(e.to_string()))
}

fn render<T, F>(
    scheduler: &PlaybackScheduler,
    tap: &LevelTap,
    scratch: &mut Vec<f32>,
    data: &mut [T],
    channels: usize,
    mut convert: F,
) where
    T: Copy,
    F: FnMut(f32) -> T,
{
    let frames = data.len() / channels.max(1);
    scratch.resize(frames, 0.0);
    scheduler.fill(scratch);
    tap.push(scratch);
    for (frame_idx, &value) in scratch.iter().enumerate() {
        let converted = convert(value);
        for ch in 0..channels {
            data[frame_idx * channels + ch] = converted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(samples: Vec<f32>) -> DecodedAudioBuffer {
        DecodedAudioBuffer {
            samples,
            sample_rate: 24_000,
        }
    }

    fn scheduler(lookahead: u64) -> PlaybackScheduler {
        PlaybackScheduler::new(24_000, lookahead, InterruptPolicy::Resync)
    }

    #[test]
    fn buffers_queue_back_to_back() {
        let s = scheduler(1_200);
        assert_eq!(s.submit(buffer(vec![0.1; 100])), Some(0));
        assert_eq!(s.submit(buffer(vec![0.2; 250])), Some(100));
        assert_eq!(s.submit(buffer(vec![0.3; 50])), Some(350));
        assert_eq!(s.next_start_samples(), 400);
    }

    #[test]
    fn gapless_when_arrivals_keep_up_with_playback() {
        let s = scheduler(1_200);
        let mut scratch = vec![0.0; 60];
        // Each buffer arrives while the previous one still has samples left.
        assert_eq!(s.submit(buffer(vec![0.1; 100])), Some(0));
        s.fill(&mut scratch);
        assert_eq!(s.submit(buffer(vec![0.2; 100])), Some(100));
        s.fill(&mut scratch);
        assert_eq!(s.submit(buffer(vec![0.3; 100])), Some(200));
    }

    #[test]
    fn stall_resyncs_ahead_of_the_cursor() {
        let s = scheduler(1_200);
        s.submit(buffer(vec![0.1; 100]));
        // Simulate a long decode stall: the device plays well past the end.
        let mut scratch = vec![0.0; 500];
        s.fill(&mut scratch);
        assert_eq!(s.submit(buffer(vec![0.2; 100])), Some(500 + 1_200));
        assert_eq!(s.next_start_samples(), 500 + 1_200 + 100);
    }

    #[test]
    fn late_buffer_is_never_scheduled_in_the_past() {
        let s = scheduler(48);
        let mut scratch = vec![0.0; 300];
        s.fill(&mut scratch);
        let start = s.submit(buffer(vec![0.5; 10])).unwrap();
        assert!(start >= s.cursor_samples());
    }

    #[test]
    fn interruption_resets_next_start_and_keeps_started_audio() {
        let s = scheduler(1_200);
        s.submit(buffer(vec![0.1; 100]));
        s.submit(buffer(vec![0.2; 100]));
        s.submit(buffer(vec![0.3; 100]));
        let mut scratch = vec![0.0; 40];
        s.fill(&mut scratch); // first buffer is mid-play
        assert!((scratch[10] - 0.1).abs() < 1e-6);

        s.interrupt();
        assert_eq!(s.next_start_samples(), s.cursor_samples());
        // Only the started buffer survives.
        assert_eq!(s.pending_buffers(), 1);

        // New audio after the interruption is placed at "now" instead of
        // waiting behind the stale queue.
        let start = s.submit(buffer(vec![0.9; 10])).unwrap();
        assert_eq!(start, 40);

        // The started buffer keeps playing to completion.
        s.fill(&mut scratch);
        assert!((scratch[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn hard_stop_policy_cuts_in_flight_audio() {
        let s = PlaybackScheduler::new(24_000, 1_200, InterruptPolicy::HardStop);
        s.submit(buffer(vec![0.1; 100]));
        let mut scratch = vec![0.0; 40];
        s.fill(&mut scratch);
        s.interrupt();
        assert_eq!(s.pending_buffers(), 0);
        s.fill(&mut scratch);
        assert_eq!(scratch, vec![0.0; 40]);
    }

    #[test]
    fn zero_length_buffer_leaves_timeline_unchanged() {
        let s = scheduler(1_200);
        s.submit(buffer(vec![0.1; 100]));
        let before = s.next_start_samples();
        assert_eq!(s.submit(buffer(Vec::new())), None);
        assert_eq!(s.next_start_samples(), before);
        // A valid buffer afterwards still schedules back-to-back.
        assert_eq!(s.submit(buffer(vec![0.2; 10])), Some(before));
    }

    #[test]
    fn fill_renders_silence_until_a_start_time() {
        let s = scheduler(8);
        let mut scratch = vec![0.0; 4];
        s.fill(&mut scratch); // cursor -> 4 with nothing queued
        let start = s.submit(buffer(vec![0.7; 4])).unwrap();
        assert_eq!(start, 4 + 8);

        let mut out = vec![1.0; 16];
        s.fill(&mut out);
        // Samples before the start are silent, then the buffer plays.
        assert_eq!(&out[..8], &[0.0; 8]);
        assert!((out[8] - 0.7).abs() < 1e-6);
        assert!((out[11] - 0.7).abs() < 1e-6);
        assert_eq!(&out[12..], &[0.0; 4]);
    }

    #[test]
    fn clear_drops_everything_and_resets() {
        let s = scheduler(1_200);
        s.submit(buffer(vec![0.1; 100]));
        s.submit(buffer(vec![0.2; 100]));
        s.clear();
        assert_eq!(s.pending_buffers(), 0);
        assert_eq!(s.next_start_samples(), s.cursor_samples());
    }
}
