//! Session configuration and validation helpers.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Sample rate the remote service expects for microphone audio.
pub const CAPTURE_RATE: u32 = 16_000;
/// Sample rate of the audio the remote service streams back.
pub const SERVICE_PLAYBACK_RATE: u32 = 24_000;
/// Power-of-two frame length at the capture rate; bounds per-chunk latency
/// while amortizing per-chunk overhead.
pub const DEFAULT_FRAME_SAMPLES: usize = 2048;
/// Re-sync lookahead applied when the pipeline falls behind the device clock.
pub const DEFAULT_LOOKAHEAD_MS: u64 = 50;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const MIN_LOOKAHEAD_MS: u64 = 5;
const MAX_LOOKAHEAD_MS: u64 = 500;
const MAX_FRAME_SAMPLES: usize = 32_768;

/// How the translation service should pick languages. The instruction text
/// built from this lives in the (external) UI layer; the pipeline only
/// carries the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LanguageMode {
    #[default]
    Auto,
    Custom,
}

/// What the playback scheduler does with audio that was already scheduled
/// when the service signals the user spoke over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPolicy {
    /// Let the buffer that already started finish; discard queued audio and
    /// start anything new immediately.
    #[default]
    Resync,
    /// Cut the in-flight buffer as well.
    HardStop,
}

/// Everything the pipeline needs to run one session. Device ids of `None`
/// mean the host's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub language_mode: LanguageMode,
    pub custom_source_language: Option<String>,
    pub custom_target_language: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub frame_samples: usize,
    pub lookahead_ms: u64,
    pub channel_capacity: usize,
    pub interrupt_policy: InterruptPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language_mode: LanguageMode::Auto,
            custom_source_language: None,
            custom_target_language: None,
            input_device: None,
            output_device: None,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            lookahead_ms: DEFAULT_LOOKAHEAD_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            interrupt_policy: InterruptPolicy::Resync,
        }
    }
}

impl SessionConfig {
    /// Reject configurations that would break real-time invariants before any
    /// device is touched.
    pub fn validate(&self) -> Result<()> {
        if self.frame_samples == 0 || !self.frame_samples.is_power_of_two() {
            bail!(
                "frame_samples must be a non-zero power of two, got {}",
                self.frame_samples
            );
        }
        if self.frame_samples > MAX_FRAME_SAMPLES {
            bail!(
                "frame_samples must be at most {MAX_FRAME_SAMPLES}, got {}",
                self.frame_samples
            );
        }
        if !(MIN_LOOKAHEAD_MS..=MAX_LOOKAHEAD_MS).contains(&self.lookahead_ms) {
            bail!(
                "lookahead_ms must be between {MIN_LOOKAHEAD_MS} and {MAX_LOOKAHEAD_MS} ms, got {}",
                self.lookahead_ms
            );
        }
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be at least 1");
        }
        if self.language_mode == LanguageMode::Custom
            && self.custom_source_language.is_none()
            && self.custom_target_language.is_none()
        {
            bail!("custom language mode requires a source or target language");
        }
        Ok(())
    }

    /// Lookahead converted to whole samples at `rate`.
    pub fn lookahead_samples(&self, rate: u32) -> u64 {
        (self.lookahead_ms * u64::from(rate)) / 1000
    }
}
