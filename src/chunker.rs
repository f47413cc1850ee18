//! Fixed-size frame accumulation on the capture path.
//!
//! Raw input samples arrive in arbitrarily-sized batches on the audio
//! callback thread; the chunker accumulates them and emits one `AudioFrame`
//! per `frame_samples` over a bounded channel. Emission uses `try_send` and
//! a dropped-frame counter so the callback never blocks on a slow consumer.

use crossbeam_channel::{Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// One mono frame of normalized samples, tagged with its sample rate.
/// Created, encoded, and discarded within a single processing step.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate.max(1))
    }
}

/// Accumulator owned by the capture callback. The pending buffer is
/// allocated once and reused via the drain pattern.
pub struct FrameChunker {
    frame_samples: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    sender: Sender<AudioFrame>,
    dropped: AtomicUsize,
}

impl FrameChunker {
    pub fn new(frame_samples: usize, sample_rate: u32, sender: Sender<AudioFrame>) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            sample_rate,
            pending: Vec::with_capacity(frame_samples * 2),
            sender,
            dropped: AtomicUsize::new(0),
        }
    }

    /// Append a batch of samples and emit every completed frame.
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.frame_samples {
            let frame = AudioFrame {
                samples: self.pending.drain(..self.frame_samples).collect(),
                sample_rate: self.sample_rate,
            };
            match self.sender.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Discard any partial frame. Called at stop; a short tail is never
    /// padded or emitted.
    pub fn flush(&mut self) {
        self.pending.clear();
    }

    /// Frames lost to a full channel.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
