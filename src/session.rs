//! Session lifecycle: owns the capture stream, the remote session handle and
//! every pipeline stage, and sequences setup, streaming and teardown.
//!
//! The state machine is `Idle -> Connecting -> Streaming -> Stopping ->
//! Stopped`, with `Stopped` reusable as `Idle`. Stop is idempotent and
//! reentrant: a single shared `active` flag is the cancellation point every
//! blocking step checks before acquiring the next resource, and teardown
//! runs exactly once, on the worker thread that owns the audio streams
//! (cpal streams are not `Send`, so they never leave it).

use crate::capture::InputDevice;
use crate::chunker::{AudioFrame, FrameChunker};
use crate::config::{SessionConfig, CAPTURE_RATE, SERVICE_PLAYBACK_RATE};
use crate::error::PipelineError;
use crate::meter::{LevelTap, VolumeCallback, VolumeMonitor};
use crate::playback::{self, PlaybackScheduler};
use crate::resample;
use crate::wire::{self, DecodeWorker, EncodedChunk};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const PUMP_TICK: Duration = Duration::from_millis(50);

/// Inbound events from the remote translation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Base64 pcm16 audio payload at the service playback rate.
    Audio(Vec<u8>),
    /// The service detected the user speaking over the output.
    Interrupted,
    /// The remote side closed the session.
    Closed,
    /// Transport-level receive failure.
    Error(String),
}

/// Notifications surfaced to the (external) UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// One inbound chunk was malformed and dropped; the stream continues.
    DecodeError(String),
    /// The transport failed mid-stream; the session is being stopped.
    TransportLost(String),
    /// The remote side closed the session.
    Closed,
}

/// The remote session as an abstract bidirectional channel. Implementations
/// wrap the concrete network transport.
pub trait RemoteSession: Send + Sync {
    /// Hand one encoded chunk to the transport. Must not assume the caller
    /// retries; a failure stops the session.
    fn send_media(&self, chunk: &EncodedChunk) -> anyhow::Result<()>;

    /// Fire-and-forget close; the remote side may already be gone.
    fn close(&self);
}

/// Opens a remote session from an opaque instruction string.
pub trait SessionConnector {
    fn connect(
        &self,
        instructions: &str,
    ) -> anyhow::Result<(Box<dyn RemoteSession>, Receiver<SessionEvent>)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Stopping,
    Stopped,
}

pub struct SessionManager {
    config: SessionConfig,
    state: Arc<Mutex<SessionState>>,
    active: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    notify_tx: Sender<PipelineEvent>,
    notify_rx: Receiver<PipelineEvent>,
    input_tap: Arc<LevelTap>,
    output_tap: Arc<LevelTap>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let (notify_tx, notify_rx) = bounded(64);
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            active: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            notify_tx,
            notify_rx,
            input_tap: LevelTap::new(),
            output_tap: LevelTap::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        *lock_unpoisoned(&self.state)
    }

    /// Pipeline notifications for the UI to poll.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.notify_rx
    }

    /// Level monitor over both taps, for the UI's render loop to poll.
    pub fn monitor(&self, callback: VolumeCallback) -> VolumeMonitor {
        VolumeMonitor::new(self.input_tap.clone(), self.output_tap.clone(), callback)
    }

    /// Open the remote session, acquire both audio devices and begin
    /// streaming. A failure after partial acquisition unwinds everything
    /// acquired so far before the error is returned.
    pub fn start(
        &self,
        connector: &dyn SessionConnector,
        instructions: &str,
    ) -> Result<(), PipelineError> {
        {
            let mut state = lock_unpoisoned(&self.state);
            match *state {
                SessionState::Idle | SessionState::Stopped => {}
                _ => return Err(PipelineError::Busy),
            }
            // The flag must be up before the state is observable as
            // Connecting, so a racing stop() always has something to clear.
            self.active.store(true, Ordering::SeqCst);
            *state = SessionState::Connecting;
        }

        let (session, inbound) = match connector.connect(instructions) {
            Ok(pair) => pair,
            Err(err) => {
                self.finish_stopped();
                return Err(PipelineError::SessionSetup(err.to_string()));
            }
        };
        let session: Arc<dyn RemoteSession> = Arc::from(session);

        // A stop may have raced the handshake; unwind instead of streaming
        // into a torn-down state.
        if !self.active.load(Ordering::SeqCst) {
            session.close();
            self.finish_stopped();
            return Ok(());
        }

        let shared = WorkerShared {
            config: self.config.clone(),
            session,
            inbound,
            active: self.active.clone(),
            state: self.state.clone(),
            notify: self.notify_tx.clone(),
            input_tap: self.input_tap.clone(),
            output_tap: self.output_tap.clone(),
        };
        let (ready_tx, ready_rx) = bounded(1);
        let handle = thread::spawn(move || run_session_worker(shared, ready_tx));
        *lock_unpoisoned(&self.worker) = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.stop();
                Err(err)
            }
            Err(_) => {
                self.stop();
                Err(PipelineError::DeviceAcquisition(
                    "audio worker exited during setup".to_string(),
                ))
            }
        }
    }

    /// Stop the session. Safe to call at any time, from any thread, any
    /// number of times; repeated and concurrent stops join the same single
    /// teardown.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let handle = lock_unpoisoned(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let mut state = lock_unpoisoned(&self.state);
        if *state != SessionState::Idle {
            *state = SessionState::Stopped;
        }
    }

    fn finish_stopped(&self) {
        self.active.store(false, Ordering::SeqCst);
        *lock_unpoisoned(&self.state) = SessionState::Stopped;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct WorkerShared {
    config: SessionConfig,
    session: Arc<dyn RemoteSession>,
    inbound: Receiver<SessionEvent>,
    active: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    notify: Sender<PipelineEvent>,
    input_tap: Arc<LevelTap>,
    output_tap: Arc<LevelTap>,
}

/// Everything the worker thread owns while streaming. Dropping the streams
/// stops and releases them; dropping the decoder joins its thread.
struct LiveStreams {
    input_stream: cpal::Stream,
    output_stream: cpal::Stream,
    scheduler: Arc<PlaybackScheduler>,
    decoder: DecodeWorker,
    sender_handle: JoinHandle<()>,
}

fn run_session_worker(shared: WorkerShared, ready: Sender<Result<(), PipelineError>>) {
    match build_streams(&shared) {
        Ok(Some(streams)) => {
            *lock_unpoisoned(&shared.state) = SessionState::Streaming;
            let _ = ready.send(Ok(()));
            run_event_pump(
                &shared.inbound,
                &streams.decoder,
                &streams.scheduler,
                &shared.active,
                &shared.notify,
            );
            teardown(&shared, streams);
        }
        Ok(None) => {
            // Stop arrived mid-setup; unwind without treating it as an error.
            shared.session.close();
            finish_worker_stopped(&shared);
            let _ = ready.send(Ok(()));
        }
        Err(err) => {
            shared.session.close();
            finish_worker_stopped(&shared);
            let _ = ready.send(Err(err));
        }
    }
}

/// Acquire devices and wire the capture -> encode -> send and decode ->
/// schedule paths. Returns `Ok(None)` when a stop raced the setup. Streams
/// built before a failure are released by drop on the error path.
fn build_streams(shared: &WorkerShared) -> Result<Option<LiveStreams>, PipelineError> {
    let cfg = &shared.config;

    let input = InputDevice::open(cfg.input_device.as_deref())
        .map_err(|e| PipelineError::DeviceAcquisition(e.to_string()))?;
    let input_config = input
        .default_config()
        .map_err(|e| PipelineError::DeviceAcquisition(e.to_string()))?;
    let input_rate = input_config.sample_rate().0;
    log::debug!(
        "capture device '{}' at {input_rate} Hz, format {:?}",
        input.name(),
        input_config.sample_format()
    );

    if !shared.active.load(Ordering::SeqCst) {
        return Ok(None);
    }

    let output = playback::open_output_device(cfg.output_device.as_deref())
        .map_err(|e| PipelineError::DeviceAcquisition(e.to_string()))?;
    let output_config = output
        .default_output_config()
        .map_err(|e| PipelineError::DeviceAcquisition(e.to_string()))?;
    let output_rate = output_config.sample_rate().0;

    let scheduler = Arc::new(PlaybackScheduler::new(
        output_rate,
        cfg.lookahead_samples(output_rate),
        cfg.interrupt_policy,
    ));

    // Chunk at the device rate, sized so one chunk resamples to exactly one
    // wire frame at the capture rate.
    let device_frame_samples =
        ((cfg.frame_samples as u64 * u64::from(input_rate)) / u64::from(CAPTURE_RATE)).max(1)
            as usize;
    let (frame_tx, frame_rx) = bounded::<AudioFrame>(cfg.channel_capacity);
    let chunker = FrameChunker::new(device_frame_samples, input_rate, frame_tx);

    let input_stream =
        input.build_capture_stream(&input_config, chunker, shared.input_tap.clone())?;
    let output_stream = playback::build_output_stream(
        &output,
        &output_config,
        scheduler.clone(),
        shared.output_tap.clone(),
    )?;

    if !shared.active.load(Ordering::SeqCst) {
        return Ok(None);
    }

    input_stream
        .play()
        .map_err(|e| PipelineError::DeviceAcquisition(e.to_string()))?;
    output_stream
        .play()
        .map_err(|e| PipelineError::DeviceAcquisition(e.to_string()))?;

    let decoder = DecodeWorker::spawn(
        scheduler.clone(),
        SERVICE_PLAYBACK_RATE,
        shared.notify.clone(),
        cfg.channel_capacity,
    );
    let sender_handle = spawn_sender_thread(
        frame_rx,
        input_rate,
        cfg.frame_samples,
        shared.session.clone(),
        shared.active.clone(),
        shared.notify.clone(),
    );

    Ok(Some(LiveStreams {
        input_stream,
        output_stream,
        scheduler,
        decoder,
        sender_handle,
    }))
}

/// Forwards completed capture frames to the remote session: resample to the
/// wire rate, length-adjust, encode, send. The capture callback never waits
/// on any of this.
fn spawn_sender_thread(
    frames: Receiver<AudioFrame>,
    input_rate: u32,
    frame_samples: usize,
    session: Arc<dyn RemoteSession>,
    active: Arc<AtomicBool>,
    notify: Sender<PipelineEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for frame in frames.iter() {
            if !active.load(Ordering::SeqCst) {
                break;
            }
            let samples = resample::resample(&frame.samples, input_rate, CAPTURE_RATE);
            let samples = resample::adjust_frame_length(samples, frame_samples);
            let wire_frame = AudioFrame {
                samples,
                sample_rate: CAPTURE_RATE,
            };
            let chunk = match wire::encode_frame(&wire_frame) {
                Ok(chunk) => chunk,
                Err(err) => {
                    log::warn!("skipping unencodable frame: {err}");
                    continue;
                }
            };
            if let Err(err) = session.send_media(&chunk) {
                log::warn!("media send failed: {err:#}");
                let _ = notify.try_send(PipelineEvent::TransportLost(err.to_string()));
                active.store(false, Ordering::SeqCst);
                break;
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpExit {
    StopRequested,
    SessionClosed,
    TransportLost,
    Disconnected,
}

/// Dispatch inbound session events until the session ends or a stop is
/// requested. Audio goes to the decode worker (FIFO), interruptions re-sync
/// the playback timeline, close/error end the pump.
pub(crate) fn run_event_pump(
    inbound: &Receiver<SessionEvent>,
    decoder: &DecodeWorker,
    scheduler: &PlaybackScheduler,
    active: &AtomicBool,
    notify: &Sender<PipelineEvent>,
) -> PumpExit {
    loop {
        if !active.load(Ordering::SeqCst) {
            return PumpExit::StopRequested;
        }
        match inbound.recv_timeout(PUMP_TICK) {
            Ok(SessionEvent::Audio(payload)) => decoder.submit(payload),
            Ok(SessionEvent::Interrupted) => scheduler.interrupt(),
            Ok(SessionEvent::Closed) => {
                let _ = notify.try_send(PipelineEvent::Closed);
                return PumpExit::SessionClosed;
            }
            Ok(SessionEvent::Error(err)) => {
                let _ = notify.try_send(PipelineEvent::TransportLost(err));
                return PumpExit::TransportLost;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return PumpExit::Disconnected,
        }
    }
}

/// Runs exactly once per session, on the worker thread. Order: metering
/// first, then the audio streams, then the workers, then the remote
/// session (errors swallowed, the remote side may already be gone).
fn teardown(shared: &WorkerShared, streams: LiveStreams) {
    *lock_unpoisoned(&shared.state) = SessionState::Stopping;

    shared.input_tap.reset();
    shared.output_tap.reset();

    if let Err(err) = streams.input_stream.pause() {
        log::debug!("failed to pause input stream: {err}");
    }
    if let Err(err) = streams.output_stream.pause() {
        log::debug!("failed to pause output stream: {err}");
    }
    // Dropping the input stream drops the chunker, which disconnects the
    // frame channel and lets the sender thread exit.
    drop(streams.input_stream);
    drop(streams.output_stream);
    let _ = streams.sender_handle.join();
    streams.scheduler.clear();
    drop(streams.decoder);

    shared.session.close();
    finish_worker_stopped(shared);
}

fn finish_worker_stopped(shared: &WorkerShared) {
    shared.active.store(false, Ordering::SeqCst);
    *lock_unpoisoned(&shared.state) = SessionState::Stopped;
}
