//! End-to-end pipeline test over the hardware-free stages: chunking,
//! wire encode/decode, background decoding, scheduling and metering.

use crossbeam_channel::bounded;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use voicebridge::chunker::{AudioFrame, FrameChunker};
use voicebridge::config::{InterruptPolicy, SERVICE_PLAYBACK_RATE};
use voicebridge::meter::LevelTap;
use voicebridge::playback::PlaybackScheduler;
use voicebridge::wire::{decode_payload, encode_frame, DecodeWorker};
use voicebridge::PipelineEvent;

fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn captured_audio_survives_the_full_loop() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Capture side: arbitrary batches in, fixed frames out.
    let (frame_tx, frame_rx) = bounded(16);
    let mut chunker = FrameChunker::new(256, 16_000, frame_tx);
    let signal: Vec<f32> = (0..512).map(|i| ((i % 64) as f32 / 64.0) - 0.5).collect();
    for batch in signal.chunks(100) {
        chunker.push(batch);
    }

    let frame = frame_rx.try_recv().expect("first frame");
    assert_eq!(frame.samples.len(), 256);
    assert_eq!(&frame.samples[..], &signal[..256]);

    // Wire: the encoded payload decodes back within quantization error.
    let chunk = encode_frame(&frame).unwrap();
    let decoded = decode_payload(chunk.data.as_bytes(), SERVICE_PLAYBACK_RATE).unwrap();
    assert_eq!(decoded.samples.len(), 256);
    for (a, b) in frame.samples.iter().zip(&decoded.samples) {
        assert!((a - b).abs() <= 1.0 / 32_768.0);
    }
}

#[test]
fn inbound_payloads_schedule_gaplessly_and_render() {
    let scheduler = Arc::new(PlaybackScheduler::new(
        SERVICE_PLAYBACK_RATE,
        1_200,
        InterruptPolicy::Resync,
    ));
    let (notify_tx, notify_rx) = bounded(16);
    let decoder = DecodeWorker::spawn(scheduler.clone(), SERVICE_PLAYBACK_RATE, notify_tx, 16);

    let payload = |value: f32, len: usize| {
        encode_frame(&AudioFrame {
            samples: vec![value; len],
            sample_rate: SERVICE_PLAYBACK_RATE,
        })
        .unwrap()
        .data
        .into_bytes()
    };

    decoder.submit(payload(0.25, 100));
    decoder.submit(payload(-0.5, 150));
    assert!(wait_until(2_000, || scheduler.next_start_samples() == 250));

    // A malformed chunk in the middle is reported and changes nothing.
    decoder.submit(b"!!not base64!!".to_vec());
    assert!(wait_until(2_000, || !notify_rx.is_empty()));
    assert!(matches!(
        notify_rx.try_recv().unwrap(),
        PipelineEvent::DecodeError(_)
    ));
    assert_eq!(scheduler.next_start_samples(), 250);

    decoder.submit(payload(0.75, 50));
    assert!(wait_until(2_000, || scheduler.next_start_samples() == 300));

    // Render the whole timeline; buffers are contiguous, in order, and the
    // output meter tracks the loudest window.
    let tap = LevelTap::new();
    let mut out = vec![0.0f32; 300];
    scheduler.fill(&mut out);
    tap.push(&out);

    assert!((out[0] - 0.25).abs() <= 1.0 / 32_768.0);
    assert!((out[99] - 0.25).abs() <= 1.0 / 32_768.0);
    assert!((out[100] + 0.5).abs() <= 1.0 / 32_768.0);
    assert!((out[249] + 0.5).abs() <= 1.0 / 32_768.0);
    assert!((out[250] - 0.75).abs() <= 1.0 / 32_768.0);
    assert!((tap.level() - 0.75).abs() <= 1.0 / 32_768.0);
    assert_eq!(scheduler.pending_buffers(), 0);
}

#[test]
fn stalled_pipeline_recovers_without_scheduling_in_the_past() {
    let scheduler = Arc::new(PlaybackScheduler::new(
        SERVICE_PLAYBACK_RATE,
        1_200,
        InterruptPolicy::Resync,
    ));
    let (notify_tx, _notify_rx) = bounded(16);
    let decoder = DecodeWorker::spawn(scheduler.clone(), SERVICE_PLAYBACK_RATE, notify_tx, 16);

    let payload = encode_frame(&AudioFrame {
        samples: vec![0.5; 100],
        sample_rate: SERVICE_PLAYBACK_RATE,
    })
    .unwrap()
    .data
    .into_bytes();

    decoder.submit(payload.clone());
    assert!(wait_until(2_000, || scheduler.next_start_samples() == 100));

    // The device plays far past the queued audio (decode stall).
    let mut sink = vec![0.0f32; 5_000];
    scheduler.fill(&mut sink);

    decoder.submit(payload);
    assert!(wait_until(2_000, || {
        scheduler.next_start_samples() == 5_000 + 1_200 + 100
    }));
    assert!(scheduler.next_start_samples() > scheduler.cursor_samples());
}
