//! Per-sensor pipeline coordination.
//!
//! Each sensor exclusively owns one detector and one predictor; the
//! coordinator drives both at 50 Hz from inbound sample bundles, forwards
//! crossings as observations, stamps wall-clock times, and handles upstream
//! resets. Time is passed in explicitly rather than read from a timer, so
//! the whole pipeline is deterministic under test.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysis::{BeatEvent, DetectorMode, RhythmPredictor, Sample, ThresholdDetector};
use crate::tunables::{ADC_MAX, BUNDLE_GAP_RESET_MS, BUNDLE_SAMPLES, SAMPLE_PERIOD_MS};

/// One inbound bundle as it appears on the wire: five raw samples and the
/// source's millisecond clock at the first of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleBundle {
    pub ppg_id: u8,
    pub samples: [i32; BUNDLE_SAMPLES],
    pub device_ms: i64,
}

/// Single monotonic reference plus a boot-time UTC offset.
///
/// Phase arithmetic runs entirely on the monotonic side; the offset is
/// applied only when stamping outgoing beat events, so wall-clock steps
/// after boot can shift absolute timestamps but never beat spacing.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    origin: Instant,
    unix_at_origin_s: f64,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            unix_at_origin_s: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    /// Monotonic milliseconds since boot.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Unix seconds at monotonic zero.
    pub fn unix_offset_s(&self) -> f64 {
        self.unix_at_origin_s
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one pipeline, for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub ppg_id: u8,
    pub detector_mode: &'static str,
    pub predictor_mode: &'static str,
    pub ibi_ms: f64,
    pub confidence: f64,
}

/// The per-sensor signal→beat pipeline: one detector, one predictor, and
/// the bookkeeping to stamp samples and spot device restarts.
#[derive(Debug)]
pub struct SensorPipeline {
    ppg_id: u8,
    detector: ThresholdDetector,
    predictor: RhythmPredictor,
    last_arrival_ms: Option<u64>,
    last_device_ms: Option<i64>,
    last_sample_ms: u64,
}

impl SensorPipeline {
    pub fn new(ppg_id: u8, unix_offset_s: f64) -> Self {
        Self {
            ppg_id,
            detector: ThresholdDetector::new(),
            predictor: RhythmPredictor::new(ppg_id, unix_offset_s),
            last_arrival_ms: None,
            last_device_ms: None,
            last_sample_ms: 0,
        }
    }

    pub fn ppg_id(&self) -> u8 {
        self.ppg_id
    }

    /// Consume one bundle stamped with its wall arrival time and return any
    /// beats the predictor scheduled while ticking through it.
    ///
    /// The bundle carries the sensor's last 100 ms: its newest sample is
    /// "now" and earlier samples are backdated one tick apiece. The device
    /// clock is never trusted for timestamps, only for restart detection.
    pub fn handle_bundle(&mut self, bundle: &SampleBundle, arrival_ms: u64) -> Vec<BeatEvent> {
        if bundle
            .samples
            .iter()
            .any(|&adc| adc < 0 || adc > ADC_MAX as i32)
        {
            // Transient input fault: drop the bundle, leave the pipeline
            // untouched.
            debug!(
                ppg_id = self.ppg_id,
                samples = ?bundle.samples,
                "dropping bundle with out-of-range samples"
            );
            return Vec::new();
        }

        if self.restart_indicated(bundle, arrival_ms) {
            info!(ppg_id = self.ppg_id, "upstream restart detected");
            self.reset();
        }
        self.last_arrival_ms = Some(arrival_ms);
        self.last_device_ms = Some(bundle.device_ms);

        let mut beats = Vec::new();
        for (i, &adc) in bundle.samples.iter().enumerate() {
            let nominal =
                arrival_ms.saturating_sub(SAMPLE_PERIOD_MS * (BUNDLE_SAMPLES - 1 - i) as u64);
            // Jittery arrivals must not run time backwards through the
            // detector or predictor.
            let t_ms = nominal.max(self.last_sample_ms + 1);
            self.last_sample_ms = t_ms;

            let sample = Sample {
                adc: adc as u16,
                t_ms,
            };
            if let Some(crossing) = self.detector.on_sample(sample) {
                self.predictor.observe(&crossing);
            }
            if let Some(beat) = self.predictor.tick(t_ms) {
                beats.push(beat);
            }
        }
        beats
    }

    /// Reset on an external `/reset` or a detected restart: the detector
    /// re-warms (no ghost crossings from a stale window) while the
    /// predictor fades out gracefully instead of cutting dead.
    pub fn reset(&mut self) {
        self.detector.reset();
        self.predictor.force_coast();
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            ppg_id: self.ppg_id,
            detector_mode: match self.detector.mode() {
                DetectorMode::Warmup => "warmup",
                DetectorMode::Active => "active",
                DetectorMode::Paused => "paused",
            },
            predictor_mode: self.predictor.mode().label(),
            ibi_ms: self.predictor.ibi_ms(),
            confidence: self.predictor.confidence(),
        }
    }

    fn restart_indicated(&self, bundle: &SampleBundle, arrival_ms: u64) -> bool {
        if let Some(last) = self.last_arrival_ms {
            if arrival_ms.saturating_sub(last) > BUNDLE_GAP_RESET_MS {
                debug!(
                    ppg_id = self.ppg_id,
                    gap_ms = arrival_ms.saturating_sub(last),
                    "bundle gap exceeds restart threshold"
                );
                return true;
            }
        }
        if let Some(last) = self.last_device_ms {
            if bundle.device_ms < last {
                debug!(
                    ppg_id = self.ppg_id,
                    device_ms = bundle.device_ms,
                    previous = last,
                    "device clock ran backwards"
                );
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::signals::{bundles_from_samples, noise_floor, pulse_wave};

    /// Feed bundles at a nominal 100 ms cadence starting at `start_ms`,
    /// stamping arrivals at each bundle's newest sample.
    fn feed_bundles(
        pipeline: &mut SensorPipeline,
        bundles: &[SampleBundle],
        start_ms: u64,
    ) -> Vec<BeatEvent> {
        let mut beats = Vec::new();
        for (k, bundle) in bundles.iter().enumerate() {
            let arrival_ms = start_ms + k as u64 * 100 + 80;
            beats.extend(pipeline.handle_bundle(bundle, arrival_ms));
        }
        beats
    }

    #[test]
    fn test_out_of_range_samples_dropped() {
        let mut pipeline = SensorPipeline::new(0, 0.0);
        let bad = SampleBundle {
            ppg_id: 0,
            samples: [100, 200, 5_000, 300, 400],
            device_ms: 0,
        };
        let beats = pipeline.handle_bundle(&bad, 80);
        assert!(beats.is_empty());
        // The malformed bundle left no trace: the next bundle is not read
        // as a restart.
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.detector_mode, "warmup");
    }

    #[test]
    fn test_clean_stream_produces_beats() {
        let mut pipeline = SensorPipeline::new(2, 0.0);
        let samples = pulse_wave(60.0, 30_000);
        let bundles = bundles_from_samples(2, &samples, 0);
        let beats = feed_bundles(&mut pipeline, &bundles, 0);

        assert!(!beats.is_empty(), "a clean 60 BPM stream must produce beats");
        for beat in &beats {
            assert_eq!(beat.ppg_id, 2);
            assert!((beat.bpm - 60.0).abs() < 2.0, "bpm {}", beat.bpm);
        }
        assert_eq!(pipeline.snapshot().detector_mode, "active");
        assert_eq!(pipeline.snapshot().predictor_mode, "locked");
    }

    #[test]
    fn test_noise_floor_never_beats() {
        let mut pipeline = SensorPipeline::new(0, 0.0);
        let samples = noise_floor(20_000, 2_040, 2_055, 7);
        let bundles = bundles_from_samples(0, &samples, 0);
        let beats = feed_bundles(&mut pipeline, &bundles, 0);
        assert!(beats.is_empty(), "noise floor must never emit beats");
        assert_eq!(pipeline.snapshot().predictor_mode, "init");
    }

    #[test]
    fn test_bundle_gap_triggers_reset() {
        let mut pipeline = SensorPipeline::new(0, 0.0);
        let samples = pulse_wave(60.0, 10_000);
        let bundles = bundles_from_samples(0, &samples, 0);
        feed_bundles(&mut pipeline, &bundles, 0);
        assert_eq!(pipeline.snapshot().detector_mode, "active");

        // Next bundle arrives two seconds late: device restart.
        let late = bundles_from_samples(0, &pulse_wave(60.0, 1_000), 50_000);
        pipeline.handle_bundle(&late[0], 12_080);
        assert_eq!(
            pipeline.snapshot().detector_mode,
            "warmup",
            "a bundle gap must re-warm the detector"
        );
    }

    #[test]
    fn test_device_clock_regression_triggers_reset() {
        let mut pipeline = SensorPipeline::new(0, 0.0);
        let samples = pulse_wave(60.0, 10_000);
        let bundles = bundles_from_samples(0, &samples, 100_000);
        feed_bundles(&mut pipeline, &bundles, 0);
        assert_eq!(pipeline.snapshot().detector_mode, "active");

        // Same wall cadence, but the device clock restarted from zero.
        let rebooted = bundles_from_samples(0, &pulse_wave(60.0, 1_000), 0);
        pipeline.handle_bundle(&rebooted[0], 10_080);
        assert_eq!(pipeline.snapshot().detector_mode, "warmup");
    }

    #[test]
    fn test_sample_stamps_stay_monotone() {
        let mut pipeline = SensorPipeline::new(0, 0.0);
        let samples = pulse_wave(60.0, 2_000);
        let bundles = bundles_from_samples(0, &samples, 0);
        // Two bundles arriving almost simultaneously (burst after a short
        // network stall): stamps must still advance.
        pipeline.handle_bundle(&bundles[0], 80);
        pipeline.handle_bundle(&bundles[1], 85);
        assert!(pipeline.last_sample_ms > 80);
    }

    #[test]
    fn test_external_reset_coasts_predictor() {
        let mut pipeline = SensorPipeline::new(0, 0.0);
        let samples = pulse_wave(60.0, 15_000);
        let bundles = bundles_from_samples(0, &samples, 0);
        feed_bundles(&mut pipeline, &bundles, 0);
        assert_eq!(pipeline.snapshot().predictor_mode, "locked");

        pipeline.reset();
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.detector_mode, "warmup");
        assert_eq!(snapshot.predictor_mode, "coast");
    }
}
