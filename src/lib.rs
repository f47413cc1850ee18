//! Real-time audio transport pipeline for live speech translation.
//!
//! Microphone samples are chunked into fixed-size frames, quantized to
//! pcm16/base64 and handed to a remote translation session; translated audio
//! streaming back from the session is decoded off the latency-critical path
//! and scheduled gaplessly against a virtual timeline on the output device.
//! The GUI and the concrete network transport live outside this crate: the
//! session arrives as an abstract bidirectional channel and the UI observes
//! the pipeline through level-meter callbacks and a pipeline event channel.

pub mod capture;
pub mod chunker;
pub mod config;
pub mod error;
pub mod meter;
pub mod playback;
pub mod resample;
pub mod session;
pub mod wire;

pub use config::{InterruptPolicy, LanguageMode, SessionConfig};
pub use error::{DecodeError, EncodeError, PipelineError};
pub use meter::{VolumeCallback, VolumeDirection, VolumeMonitor};
pub use session::{
    PipelineEvent, RemoteSession, SessionConnector, SessionEvent, SessionManager, SessionState,
};
pub use wire::{DecodedAudioBuffer, EncodedChunk};
