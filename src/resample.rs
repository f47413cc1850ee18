//! Sample-rate conversion between device clocks and the wire rates.
//!
//! The capture device rarely runs at the 16 kHz the service ingests, and the
//! 24 kHz translated audio rarely matches the output device, so both paths
//! go through here. The default path is a short FIR low-pass (when
//! decimating) followed by linear interpolation; the `high-quality-audio`
//! feature swaps in a rubato sinc resampler for `resample` and falls back to
//! the basic path if construction fails.
//!
//! `resample` is for self-contained frames (the capture leg, where each
//! frame is length-adjusted afterwards). `resample_stream` is for
//! back-to-back buffers of a continuous stream (the playback leg): the sinc
//! resampler is rebuilt per call and resets its filter state at every chunk
//! boundary, which seams audibly across consecutive buffers, so the
//! streaming path always stays on FIR/linear.

#[cfg(feature = "high-quality-audio")]
use anyhow::{anyhow, Result};
#[cfg(feature = "high-quality-audio")]
use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};
use std::f32::consts::PI;
#[cfg(feature = "high-quality-audio")]
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "high-quality-audio")]
static SINC_FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

/// Convert mono samples from `from_rate` to `to_rate`.
#[cfg(feature = "high-quality-audio")]
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || to_rate == 0 || input.is_empty() || from_rate == to_rate {
        return input.to_vec();
    }
    match resample_sinc(input, from_rate, to_rate) {
        Ok(output) => output,
        Err(err) => {
            if !SINC_FALLBACK_WARNED.swap(true, Ordering::AcqRel) {
                log::warn!("sinc resampler failed ({err}); falling back to FIR path");
            }
            basic_resample(input, from_rate, to_rate)
        }
    }
}

#[cfg(not(feature = "high-quality-audio"))]
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    basic_resample(input, from_rate, to_rate)
}

/// Convert one chunk of a continuous stream. No per-call filter state, no
/// tail padding: output length is exactly the rate-scaled input length, so
/// consecutive chunks concatenate without seams.
pub fn resample_stream(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    basic_resample(input, from_rate, to_rate)
}

#[cfg(feature = "high-quality-audio")]
fn resample_sinc(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let chunk = 256usize;
    let params = InterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.90,
        interpolation: InterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut rs = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk, 1)
        .map_err(|e| anyhow!("failed to construct sinc resampler: {e:?}"))?;

    let expect =
        ((input.len() as u64) * u64::from(to_rate) / u64::from(from_rate)) as usize + 8;
    let mut out = Vec::with_capacity(expect);
    let mut seg = vec![0.0f32; chunk];
    let mut idx = 0usize;
    while idx < input.len() {
        let end = (idx + chunk).min(input.len());
        let len = end - idx;
        seg[..len].copy_from_slice(&input[idx..end]);
        if len < chunk {
            let pad = seg.get(len.wrapping_sub(1)).copied().unwrap_or(0.0);
            for s in &mut seg[len..] {
                *s = pad;
            }
        }
        let produced = rs
            .process(std::slice::from_ref(&seg), None)
            .map_err(|e| anyhow!("resampler process failed: {e:?}"))?;
        out.extend_from_slice(&produced[0]);
        idx = end;
    }

    if out.len() > expect {
        out.truncate(expect);
    } else if out.len() < expect {
        out.resize(expect, *out.last().unwrap_or(&0.0));
    }
    Ok(out)
}

fn basic_resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || to_rate == 0 || input.is_empty() || from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = to_rate as f32 / from_rate as f32;
    let filtered = if from_rate > to_rate {
        // Tame frequencies above the target Nyquist before dropping samples.
        let taps = decimation_tap_count(from_rate, to_rate);
        low_pass_fir(input, from_rate, to_rate, taps)
    } else {
        input.to_vec()
    };
    resample_linear(&filtered, ratio)
}

/// Linear interpolation; fine for speech frames where latency matters more
/// than phase accuracy.
pub fn resample_linear(input: &[f32], ratio: f32) -> Vec<f32> {
    let input_len = input.len();
    let output_len = (input_len as f32 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f32 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = src_idx - idx as f32;
        if idx + 1 < input_len {
            output.push(input[idx] * (1.0 - frac) + input[idx + 1] * frac);
        } else if idx < input_len {
            output.push(input[idx]);
        } else {
            output.push(input.last().copied().unwrap_or(0.0));
        }
    }
    output
}

/// Truncate or pad so a resampled frame lands on the exact wire frame size.
pub fn adjust_frame_length(mut data: Vec<f32>, desired: usize) -> Vec<f32> {
    if data.len() > desired {
        data.truncate(desired);
    } else if data.len() < desired {
        let pad = *data.last().unwrap_or(&0.0);
        data.resize(desired, pad);
    }
    data
}

fn decimation_tap_count(from_rate: u32, to_rate: u32) -> usize {
    let decimation_ratio = from_rate as f32 / to_rate.max(1) as f32;
    let mut taps = (decimation_ratio * 4.0).ceil().max(11.0) as usize;
    if taps % 2 == 0 {
        taps += 1;
    }
    taps
}

fn low_pass_fir(input: &[f32], from_rate: u32, to_rate: u32, taps: usize) -> Vec<f32> {
    if input.is_empty() || taps <= 1 {
        return input.to_vec();
    }
    let normalized_cutoff = (to_rate as f32 * 0.5 / from_rate as f32).min(0.499);
    let coeffs = design_low_pass(normalized_cutoff, taps);
    let half = taps / 2;
    let mut output = Vec::with_capacity(input.len());

    for n in 0..input.len() {
        let mut acc = 0.0;
        for (k, coeff) in coeffs.iter().enumerate() {
            if let Some(idx) = n.checked_add(k).and_then(|sum| sum.checked_sub(half)) {
                if let Some(sample) = input.get(idx) {
                    acc += *sample * coeff;
                }
            }
        }
        output.push(acc);
    }
    output
}

/// Normalized Hamming-windowed sinc taps.
fn design_low_pass(normalized_cutoff: f32, taps: usize) -> Vec<f32> {
    let mut coeffs = Vec::with_capacity(taps);
    let m = (taps - 1) as f32;

    for n in 0..taps {
        let centered = n as f32 - m / 2.0;
        let x = 2.0 * PI * normalized_cutoff * centered;
        let sinc = if x.abs() < 1e-6 {
            2.0 * normalized_cutoff
        } else {
            (2.0 * normalized_cutoff * x.sin()) / x
        };
        let window = if m.abs() < f32::EPSILON {
            1.0
        } else {
            0.54 - 0.46 * ((2.0 * PI * n as f32) / m).cos()
        };
        coeffs.push(sinc * window);
    }

    let sum: f32 = coeffs.iter().sum();
    if sum.abs() > f32::EPSILON {
        for coeff in coeffs.iter_mut() {
            *coeff /= sum;
        }
    }
    coeffs
}
