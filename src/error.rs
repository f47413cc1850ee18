//! Error taxonomy for the transport pipeline.
//!
//! Per-chunk decode failures are recoverable and never tear the stream down;
//! device and session-setup failures abort startup after a full unwind of
//! whatever was partially acquired. Stopping an already-stopped pipeline is
//! a no-op and has no error variant here.

use thiserror::Error;

/// Errors a failed start surfaces to the caller. Mid-stream failures
/// (transport loss, bad chunks) travel the pipeline event channel instead
/// and trigger the stop transition rather than a `Result`.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Microphone or output device could not be acquired or configured.
    #[error("audio device unavailable: {0}")]
    DeviceAcquisition(String),

    /// The remote session handshake failed before streaming began.
    #[error("remote session setup failed: {0}")]
    SessionSetup(String),

    /// Start requested while a session is already connecting or streaming.
    #[error("pipeline is already running")]
    Busy,
}

/// Rejection of a malformed frame handed to the wire encoder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("cannot encode an empty audio frame")]
    EmptyFrame,
}

/// Recoverable failure decoding one inbound payload; the chunk is dropped
/// and playback continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("inbound payload is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("pcm16 payload has an odd byte count ({0})")]
    TruncatedPcm(usize),
}
