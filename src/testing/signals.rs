//! Synthetic PPG waveforms at the pipeline's 50 Hz sample rate.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::pipeline::SampleBundle;
use crate::tunables::{ADC_MAX, BUNDLE_SAMPLES, SAMPLE_PERIOD_MS};

/// Synthetic pulse stream at `bpm` with the default shape.
pub fn pulse_wave(bpm: f64, duration_ms: u64) -> Vec<u16> {
    pulse_wave_with(bpm, duration_ms, 2_000.0, 1_200.0, 150.0)
}

/// Synthetic pulse stream with explicit shape parameters.
///
/// Each cycle is a sharp systolic upstroke over its first 15% riding on a
/// low-amplitude baseline sway at the cardiac frequency. The sway keeps the
/// rolling MAD well above the detector's quality floor while the peak alone
/// clears the adaptive threshold, so the stream yields exactly one upward
/// crossing per cycle.
pub fn pulse_wave_with(
    bpm: f64,
    duration_ms: u64,
    baseline: f64,
    pulse_amp: f64,
    sway_amp: f64,
) -> Vec<u16> {
    let period_ms = 60_000.0 / bpm;
    let count = duration_ms / SAMPLE_PERIOD_MS;
    (0..count)
        .map(|i| {
            let t_ms = (i * SAMPLE_PERIOD_MS) as f64;
            let u = (t_ms % period_ms) / period_ms;
            let sway = sway_amp * (std::f64::consts::TAU * u).sin();
            let pulse = if u < 0.15 {
                pulse_amp * (std::f64::consts::PI * u / 0.15).sin()
            } else {
                0.0
            };
            to_adc(baseline + sway + pulse)
        })
        .collect()
}

/// Uniform noise in `[lo, hi]`: a sensor seeing no capillary signal.
pub fn noise_floor(duration_ms: u64, lo: u16, hi: u16, seed: u64) -> Vec<u16> {
    let mut rng = StdRng::seed_from_u64(seed);
    let count = duration_ms / SAMPLE_PERIOD_MS;
    (0..count).map(|_| rng.gen_range(lo..=hi)).collect()
}

/// Rhythmically clipped stream: each cycle spends `low_n` samples on the
/// bottom rail, `mid_n` mid-range, and `high_n` on the top rail. An
/// over-driven sensor whose waveform still carries the cardiac rhythm.
pub fn clipped_square(low_n: usize, mid_n: usize, high_n: usize, duration_ms: u64) -> Vec<u16> {
    let cycle: Vec<u16> = std::iter::repeat(0u16)
        .take(low_n)
        .chain(std::iter::repeat(2_047).take(mid_n))
        .chain(std::iter::repeat(ADC_MAX).take(high_n))
        .collect();
    let count = (duration_ms / SAMPLE_PERIOD_MS) as usize;
    cycle.iter().cycle().take(count).copied().collect()
}

/// Chunk a sample stream into wire bundles for one sensor. `device_start_ms`
/// seeds the synthetic device clock, which advances 100 ms per bundle.
pub fn bundles_from_samples(ppg_id: u8, samples: &[u16], device_start_ms: i64) -> Vec<SampleBundle> {
    samples
        .chunks_exact(BUNDLE_SAMPLES)
        .enumerate()
        .map(|(k, chunk)| {
            let mut bundle_samples = [0i32; BUNDLE_SAMPLES];
            for (slot, &adc) in bundle_samples.iter_mut().zip(chunk) {
                *slot = adc as i32;
            }
            SampleBundle {
                ppg_id,
                samples: bundle_samples,
                device_ms: device_start_ms + (k as i64) * 100,
            }
        })
        .collect()
}

fn to_adc(value: f64) -> u16 {
    value.round().clamp(0.0, ADC_MAX as f64) as u16
}
