//! Live amplitude metering for the capture and playback directions.
//!
//! The audio callbacks write short sample windows into fixed ring buffers
//! through `try_lock`, so a busy meter can never stall an audio thread. The
//! UI polls `VolumeMonitor` on its own display-refresh cadence, decoupled
//! from chunk boundaries, and receives one scalar per direction per tick.
//!
//! The canonical loudness metric is peak absolute deviation over the window,
//! clamped to [0.0, 1.0].

use std::sync::{Arc, Mutex};

/// Samples retained per direction; at 16-24 kHz this is a 40-65 ms window,
/// comfortably longer than one display frame.
pub const METER_WINDOW_SAMPLES: usize = 1024;

/// Which half of the pipeline a level reading describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeDirection {
    Input,
    Output,
}

/// Callback handed in by the UI layer; invoked once per direction per poll.
pub type VolumeCallback = Box<dyn Fn(VolumeDirection, f32) + Send + Sync>;

struct Window {
    buf: Box<[f32; METER_WINDOW_SAMPLES]>,
    pos: usize,
}

/// One direction's sample tap. Cheap to clone via `Arc` into a callback.
pub struct LevelTap {
    window: Mutex<Window>,
}

impl LevelTap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            window: Mutex::new(Window {
                buf: Box::new([0.0; METER_WINDOW_SAMPLES]),
                pos: 0,
            }),
        })
    }

    /// Overwrite the ring with the newest samples. Called from an audio
    /// callback; skips the write entirely if the meter is mid-read.
    pub fn push(&self, samples: &[f32]) {
        let Ok(mut guard) = self.window.try_lock() else {
            return;
        };
        let window = &mut *guard;
        for &sample in samples {
            window.buf[window.pos] = sample;
            window.pos = (window.pos + 1) % METER_WINDOW_SAMPLES;
        }
    }

    /// Peak absolute deviation over the current window, clamped to [0, 1].
    pub fn level(&self) -> f32 {
        let Ok(window) = self.window.lock() else {
            return 0.0;
        };
        let peak = window.buf.iter().map(|s| s.abs()).fold(0.0_f32, f32::max);
        peak.clamp(0.0, 1.0)
    }

    /// Zero the window so a stopped stream reads as silence immediately.
    pub fn reset(&self) {
        if let Ok(mut window) = self.window.lock() {
            window.buf.fill(0.0);
            window.pos = 0;
        }
    }
}

/// Polled by the UI once per rendered frame. Holds both taps and the
/// externally supplied callback; `poll` allocates nothing.
pub struct VolumeMonitor {
    input: Arc<LevelTap>,
    output: Arc<LevelTap>,
    callback: VolumeCallback,
}

impl VolumeMonitor {
    pub fn new(input: Arc<LevelTap>, output: Arc<LevelTap>, callback: VolumeCallback) -> Self {
        Self {
            input,
            output,
            callback,
        }
    }

    pub fn poll(&self) {
        (self.callback)(VolumeDirection::Input, self.input.level());
        (self.callback)(VolumeDirection::Output, self.output.level());
    }
}
