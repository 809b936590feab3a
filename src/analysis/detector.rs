//! Quality-gated threshold detector.
//!
//! Gates a noisy ADC stream behind robust signal-quality checks and emits
//! upward threshold crossings as observations for the rhythm predictor.
//! The adaptive threshold is `median + K * MAD`, clamped at the top ADC
//! rail: rhythmic clipping drives the window MAD so high that the raw
//! threshold leaves the 12-bit range, and the clamp keeps those streams
//! emitting while stuck rails are screened out by the saturation gate.

use tracing::debug;

use crate::analysis::stats::MadWindow;
use crate::analysis::{Crossing, Sample};
use crate::tunables::{
    BOTTOM_RAIL, MAD_MIN_QUALITY, MAD_THRESHOLD_K, RECOVERY_MS, SAT_THRESHOLD, TOP_RAIL,
};

/// Detector operating mode, one per sensor.
///
/// WARMUP while the window refills, ACTIVE while quality checks pass, and
/// PAUSED while they fail; transitions are gated by MAD and saturation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    Warmup,
    Active,
    Paused,
}

#[derive(Debug)]
pub struct ThresholdDetector {
    window: MadWindow,
    mode: DetectorMode,
    above_threshold: bool,
    good_signal_ms: u64,
    prev: Option<Sample>,
}

impl ThresholdDetector {
    pub fn new() -> Self {
        Self {
            window: MadWindow::new(),
            mode: DetectorMode::Warmup,
            above_threshold: false,
            good_signal_ms: 0,
            prev: None,
        }
    }

    pub fn mode(&self) -> DetectorMode {
        self.mode
    }

    /// Reinitialize in place after an upstream reset; the window must refill
    /// before any crossing can be emitted again.
    pub fn reset(&mut self) {
        self.window.clear();
        self.mode = DetectorMode::Warmup;
        self.above_threshold = false;
        self.good_signal_ms = 0;
        self.prev = None;
    }

    /// Feed one sample; returns a crossing when one fires.
    ///
    /// Crossing edges are tracked in every non-WARMUP state so that a rise
    /// which began while PAUSED cannot re-fire on recovery, but only ACTIVE
    /// emits.
    pub fn on_sample(&mut self, sample: Sample) -> Option<Crossing> {
        self.window.push(sample.adc);

        let Some(stats) = self.window.stats() else {
            // Still warming up: no statistics, no threshold, no emission.
            self.prev = Some(sample);
            return None;
        };

        let saturation = self.window.saturation_fraction(BOTTOM_RAIL, TOP_RAIL);
        let good = stats.mad >= MAD_MIN_QUALITY && saturation < SAT_THRESHOLD;
        let dt_ms = self
            .prev
            .map(|p| sample.t_ms.saturating_sub(p.t_ms))
            .unwrap_or(0);
        self.step_mode(good, dt_ms);

        let threshold = (stats.median + MAD_THRESHOLD_K * stats.mad).min(TOP_RAIL as f64);
        let crossing = self.track_crossing(sample, threshold, stats.mad);
        self.prev = Some(sample);
        crossing
    }

    fn step_mode(&mut self, good: bool, dt_ms: u64) {
        match self.mode {
            DetectorMode::Warmup => {
                // The window just filled; quality decides where we land.
                self.mode = if good {
                    DetectorMode::Active
                } else {
                    DetectorMode::Paused
                };
                self.good_signal_ms = 0;
                debug!(mode = ?self.mode, "detector warmup complete");
            }
            DetectorMode::Active => {
                if !good {
                    self.mode = DetectorMode::Paused;
                    self.good_signal_ms = 0;
                    debug!("detector paused: quality dropped");
                }
            }
            DetectorMode::Paused => {
                if good {
                    self.good_signal_ms = self.good_signal_ms.saturating_add(dt_ms);
                    if self.good_signal_ms >= RECOVERY_MS {
                        self.mode = DetectorMode::Active;
                        debug!(sustained_ms = self.good_signal_ms, "detector recovered");
                    }
                } else {
                    self.good_signal_ms = 0;
                }
            }
        }
    }

    fn track_crossing(&mut self, sample: Sample, threshold: f64, mad: f64) -> Option<Crossing> {
        let prev = self.prev?;
        let value = sample.adc as f64;

        if (prev.adc as f64) < threshold && value >= threshold {
            if !self.above_threshold {
                self.above_threshold = true;
                if self.mode == DetectorMode::Active {
                    return Some(Crossing {
                        t_ms: sample.t_ms,
                        value: sample.adc,
                        threshold,
                        mad,
                    });
                }
            }
        } else if value < threshold {
            self.above_threshold = false;
        }
        None
    }
}

impl Default for ThresholdDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunables::{MAD_WINDOW, SAMPLE_PERIOD_MS};

    /// Feed a slice of ADC values at the nominal 20 ms spacing, collecting
    /// any crossings. `start_ms` lets tests continue a previous stream.
    fn feed(
        detector: &mut ThresholdDetector,
        values: &[u16],
        start_ms: u64,
    ) -> Vec<Crossing> {
        values
            .iter()
            .enumerate()
            .filter_map(|(i, &adc)| {
                detector.on_sample(Sample {
                    adc,
                    t_ms: start_ms + i as u64 * SAMPLE_PERIOD_MS,
                })
            })
            .collect()
    }

    /// Spiky pulse train: mostly a swaying baseline with one sharp peak per
    /// `period` samples. MAD stays well above the quality floor while the
    /// peak clears the adaptive threshold once per cycle.
    fn pulse_train(cycles: usize, period: usize) -> Vec<u16> {
        let mut values = Vec::with_capacity(cycles * period);
        for _ in 0..cycles {
            for i in 0..period {
                let u = i as f64 / period as f64;
                let sway = 150.0 * (std::f64::consts::TAU * u).sin();
                let pulse = if u < 0.15 {
                    1_200.0 * (std::f64::consts::PI * u / 0.15).sin()
                } else {
                    0.0
                };
                values.push((2_000.0 + sway + pulse).round() as u16);
            }
        }
        values
    }

    #[test]
    fn test_warmup_emits_nothing() {
        let mut detector = ThresholdDetector::new();
        // Fewer samples than the window: must stay in WARMUP, emit nothing,
        // even for a wildly swinging signal.
        let values: Vec<u16> = (0..MAD_WINDOW as u16 - 1).map(|i| (i % 2) * 4_000).collect();
        let crossings = feed(&mut detector, &values, 0);
        assert!(crossings.is_empty(), "no crossings may be emitted in WARMUP");
        assert_eq!(detector.mode(), DetectorMode::Warmup);
    }

    #[test]
    fn test_noise_floor_pauses() {
        let mut detector = ThresholdDetector::new();
        // Near-constant stream: MAD far below the quality floor.
        let values: Vec<u16> = (0..MAD_WINDOW * 2).map(|i| 2_040 + (i % 16) as u16).collect();
        let crossings = feed(&mut detector, &values, 0);
        assert!(crossings.is_empty());
        assert_eq!(detector.mode(), DetectorMode::Paused, "low-MAD stream must pause");
    }

    #[test]
    fn test_pulse_train_activates_and_fires_once_per_cycle() {
        let mut detector = ThresholdDetector::new();
        let values = pulse_train(10, 50); // 10 s at 1 Hz
        let crossings = feed(&mut detector, &values, 0);
        assert_eq!(detector.mode(), DetectorMode::Active);
        // Warmup consumes the first two cycles; each remaining cycle yields
        // exactly one upward crossing.
        assert!(
            (7..=8).contains(&crossings.len()),
            "expected one crossing per post-warmup cycle, got {}",
            crossings.len()
        );
        for pair in crossings.windows(2) {
            let gap = pair[1].t_ms - pair[0].t_ms;
            assert_eq!(gap, 1_000, "crossings should be one cycle apart, got {} ms", gap);
        }
    }

    #[test]
    fn test_rhythmic_clipping_stays_active() {
        let mut detector = ThresholdDetector::new();
        // 40% low rail, 20% mid, 40% high rail per 5-sample cycle: every
        // full window splits 40/20/40 and neither rail reaches 0.8.
        let cycle = [0u16, 0, 2_047, 4_095, 4_095];
        let values: Vec<u16> = cycle.iter().cycle().take(MAD_WINDOW * 3).copied().collect();
        let crossings = feed(&mut detector, &values, 0);
        assert_eq!(
            detector.mode(),
            DetectorMode::Active,
            "split-rail clipping must not read as saturation"
        );
        // The clamped threshold keeps the mid->high edge firing.
        assert!(!crossings.is_empty(), "clipped-but-rhythmic streams must still emit");
    }

    #[test]
    fn test_stuck_rail_pauses() {
        let mut detector = ThresholdDetector::new();
        // 85% pinned high with enough mid samples to keep MAD large.
        let mut values = Vec::new();
        for i in 0..MAD_WINDOW * 2 {
            values.push(if i % 20 < 17 { 4_095 } else { 1_000 });
        }
        feed(&mut detector, &values, 0);
        assert_eq!(detector.mode(), DetectorMode::Paused, "a stuck rail must pause");
    }

    #[test]
    fn test_recovery_requires_sustained_quality() {
        let mut detector = ThresholdDetector::new();
        // Pause on a flat stream first.
        let flat: Vec<u16> = vec![2_048; MAD_WINDOW];
        feed(&mut detector, &flat, 0);
        assert_eq!(detector.mode(), DetectorMode::Paused);

        // Good signal resumes; recovery takes RECOVERY_MS of sustained
        // quality, and quality itself only returns once the window has
        // flushed the flat stretch.
        let good = pulse_train(8, 50);
        let start = MAD_WINDOW as u64 * SAMPLE_PERIOD_MS;
        let mut recovered_at = None;
        for (i, &adc) in good.iter().enumerate() {
            let t_ms = start + i as u64 * SAMPLE_PERIOD_MS;
            detector.on_sample(Sample { adc, t_ms });
            if detector.mode() == DetectorMode::Active && recovered_at.is_none() {
                recovered_at = Some(t_ms - start);
            }
        }
        let recovered_at = recovered_at.expect("detector should recover on a clean pulse train");
        assert!(
            recovered_at >= RECOVERY_MS,
            "recovered after only {} ms of good signal",
            recovered_at
        );
    }

    #[test]
    fn test_no_emission_while_paused() {
        let mut detector = ThresholdDetector::new();
        let flat: Vec<u16> = vec![2_048; MAD_WINDOW];
        feed(&mut detector, &flat, 0);
        assert_eq!(detector.mode(), DetectorMode::Paused);

        // A pulse train immediately produces crossing-shaped edges, but
        // nothing may emit until the detector has re-activated.
        let good = pulse_train(2, 50);
        let start = MAD_WINDOW as u64 * SAMPLE_PERIOD_MS;
        for (i, &adc) in good.iter().enumerate() {
            let t_ms = start + i as u64 * SAMPLE_PERIOD_MS;
            let crossing = detector.on_sample(Sample { adc, t_ms });
            if detector.mode() != DetectorMode::Active {
                assert!(crossing.is_none(), "emitted while {:?}", detector.mode());
            }
        }
    }

    #[test]
    fn test_reset_returns_to_warmup() {
        let mut detector = ThresholdDetector::new();
        let values = pulse_train(5, 50);
        feed(&mut detector, &values, 0);
        assert_eq!(detector.mode(), DetectorMode::Active);

        detector.reset();
        assert_eq!(detector.mode(), DetectorMode::Warmup);

        // A full window is required before anything can emit again.
        let more = pulse_train(2, 50);
        let crossings = feed(&mut detector, &more[..MAD_WINDOW - 1], 20_000);
        assert!(crossings.is_empty(), "reset detector must re-warm before emitting");
    }
}
