//! # Audio Frame Codec
//!
//! Pure, stateless operations on `AudioFrame`s:
//! - **resample**: convert between the telephony rate and the AI rate
//! - **rms**: root-mean-square energy
//! - **normalize**: gain toward a target RMS, bounded by a maximum gain
//! - **is_silence**: RMS below a threshold
//!
//! ## Fail-closed policy:
//! Audio continuity beats correctness mid-call. Whenever an operation cannot
//! be carried out (zero rates, non-finite parameters) it logs the cause and
//! hands back the input frame unchanged instead of returning an error.

use crate::audio::frame::AudioFrame;
use tracing::warn;

/// Resample `frame` to `to_rate` by linear interpolation.
///
/// ## Length contract:
/// Output sample count is `round(len * to_rate / from_rate)`, so a frame keeps
/// its duration. Going up by an integer ratio and back down restores the
/// original sample count exactly.
pub fn resample(frame: &AudioFrame, to_rate: u32) -> AudioFrame {
    let from_rate = frame.sample_rate();

    if from_rate == to_rate {
        return frame.clone();
    }

    if from_rate == 0 || to_rate == 0 {
        warn!(from_rate, to_rate, "Cannot resample with a zero sample rate, passing frame through");
        return frame.clone();
    }

    if frame.channels() != 1 {
        warn!(channels = frame.channels(), "Only mono frames are resampled, passing frame through");
        return frame.clone();
    }

    let input = frame.samples();
    if input.is_empty() {
        return frame.derive(Vec::new(), to_rate);
    }

    let (num, den) = reduced_ratio(to_rate, from_rate);
    let out_len = scaled_len(input.len(), num, den);
    let mut output = Vec::with_capacity(out_len);

    // Position of output sample i in input coordinates is i * den / num.
    let last = input.len() - 1;
    for i in 0..out_len {
        let pos_num = i as u64 * den;
        let idx = (pos_num / num) as usize;
        let frac = (pos_num % num) as f64 / num as f64;

        let a = input[idx.min(last)] as f64;
        let b = input[(idx + 1).min(last)] as f64;
        let value = a + (b - a) * frac;
        output.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    frame.derive(output, to_rate)
}

/// Root-mean-square energy of the frame's samples. Empty frames have RMS 0.
pub fn rms(frame: &AudioFrame) -> f64 {
    let samples = frame.samples();
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt()
}

/// Scale the frame toward `target_rms`, never amplifying beyond `max_gain`.
///
/// ## Behavior:
/// - Current RMS of zero → input returned unchanged
/// - Gain = target / current, clamped to `[0, max_gain]`; loud frames are attenuated
/// - Samples saturate at the i16 range instead of wrapping
pub fn normalize(frame: &AudioFrame, target_rms: f64, max_gain: f64) -> AudioFrame {
    if !target_rms.is_finite() || target_rms < 0.0 || !max_gain.is_finite() || max_gain <= 0.0 {
        warn!(target_rms, max_gain, "Invalid normalization parameters, passing frame through");
        return frame.clone();
    }

    let current = rms(frame);
    if current == 0.0 {
        return frame.clone();
    }

    let gain = (target_rms / current).clamp(0.0, max_gain);
    apply_gain(frame, gain)
}

/// Multiply every sample by `gain`, saturating at the i16 range.
pub fn apply_gain(frame: &AudioFrame, gain: f64) -> AudioFrame {
    if !gain.is_finite() || gain < 0.0 {
        warn!(gain, "Invalid gain, passing frame through");
        return frame.clone();
    }

    let samples = frame
        .samples()
        .iter()
        .map(|&s| ((s as f64) * gain).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
        .collect();
    frame.derive(samples, frame.sample_rate())
}

/// True when the frame's RMS is strictly below `threshold`.
pub fn is_silence(frame: &AudioFrame, threshold: f64) -> bool {
    if threshold.is_nan() {
        warn!("Silence threshold is NaN, treating frame as speech");
        return false;
    }
    rms(frame) < threshold
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// `to / from` reduced to lowest terms.
fn reduced_ratio(to_rate: u32, from_rate: u32) -> (u64, u64) {
    let g = gcd(to_rate as u64, from_rate as u64);
    (to_rate as u64 / g, from_rate as u64 / g)
}

/// `round(len * num / den)` in integer arithmetic, halves rounded up.
fn scaled_len(len: usize, num: u64, den: u64) -> usize {
    ((len as u64 * num * 2 + den) / (den * 2)) as usize
}
