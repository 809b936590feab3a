//! Pipeline tunables.
//!
//! Every knob of the signal→beat core is a compile-time constant; the
//! deployment surface (addresses, capture paths) lives in [`crate::config`]
//! instead. `validate` runs once at engine startup and aborts init when a
//! constant has been edited outside its physical bounds.

use crate::error::ConfigError;

/// Rolling statistics window size (samples). 2 s at 50 Hz.
pub const MAD_WINDOW: usize = 100;

/// Threshold scale: `threshold = median + K * MAD`.
pub const MAD_THRESHOLD_K: f64 = 4.5;

/// Minimum window MAD for the detector to be ACTIVE.
pub const MAD_MIN_QUALITY: f64 = 40.0;

/// Saturation fraction at which the sensor is deemed stuck on a rail.
pub const SAT_THRESHOLD: f64 = 0.8;

/// Rail boundaries for saturation counting (12-bit ADC).
pub const BOTTOM_RAIL: u16 = 10;
pub const TOP_RAIL: u16 = 4085;

/// Sustained-good duration required to leave PAUSED.
pub const RECOVERY_MS: u64 = 2_000;

/// Allowable inter-beat interval, 45..150 BPM.
pub const IBI_MIN_MS: f64 = 400.0;
pub const IBI_MAX_MS: f64 = 1_333.0;

/// EMA weight for a newly observed IBI.
pub const IBI_BLEND: f64 = 0.10;

/// Observations beyond this ratio from the current estimate are rejected.
pub const IBI_OUTLIER_FACTOR: f64 = 1.5;

/// Weight on the phase-error correction applied per observation.
pub const PHASE_CORR_WEIGHT: f64 = 0.10;

/// Clamp on the phase-error magnitude before weighting.
pub const PHASE_CORR_MAX: f64 = 0.20;

/// Ignore observations arriving sooner than this fraction of the IBI.
pub const OBS_DEBOUNCE: f64 = 0.7;

/// Confidence step per observation during INIT and coast recovery.
pub const CONF_RAMP: f64 = 0.2;

/// Observations required to leave INIT.
pub const INIT_OBS: usize = 5;

/// Confidence decays linearly 1 -> 0 over this span without observations.
pub const COAST_MS: f64 = 10_000.0;

/// Emission lookahead for predicted beat timestamps.
pub const LOOKAHEAD_MS: f64 = 150.0;

/// Tick rate per pipeline (samples per second).
pub const UPDATE_HZ: u32 = 50;

/// Milliseconds between consecutive samples (1000 / UPDATE_HZ).
pub const SAMPLE_PERIOD_MS: u64 = 20;

/// Samples per inbound bundle; one bundle every 100 ms per sensor.
pub const BUNDLE_SAMPLES: usize = 5;

/// A hole this long in a sensor's 10 Hz bundle stream indicates a device
/// restart; short dropouts below it are absorbed by the predictor's coast.
pub const BUNDLE_GAP_RESET_MS: u64 = 1_000;

/// Largest representable ADC reading.
pub const ADC_MAX: u16 = 4_095;

/// Sensor id slots: 0-3 physical, 4-7 reserved for replayed channels.
pub const SENSOR_SLOTS: usize = 8;
pub const VIRTUAL_ID_BASE: u8 = 4;

/// Check the constants against their physical bounds. Fatal at startup:
/// a pipeline running with a nonsensical constant would silently produce
/// garbage beats rather than fail.
pub fn validate() -> Result<(), ConfigError> {
    fn invalid(name: &'static str, details: String) -> Result<(), ConfigError> {
        Err(ConfigError::InvalidTunable { name, details })
    }

    if MAD_WINDOW < 2 {
        return invalid("MAD_WINDOW", format!("{} is too small for a median", MAD_WINDOW));
    }
    if !(MAD_THRESHOLD_K.is_finite() && MAD_THRESHOLD_K > 0.0) {
        return invalid("MAD_THRESHOLD_K", format!("{} must be finite and positive", MAD_THRESHOLD_K));
    }
    if MAD_MIN_QUALITY < 0.0 {
        return invalid("MAD_MIN_QUALITY", format!("{} must be non-negative", MAD_MIN_QUALITY));
    }
    if !(0.0 < SAT_THRESHOLD && SAT_THRESHOLD <= 1.0) {
        return invalid("SAT_THRESHOLD", format!("{} must be in (0, 1]", SAT_THRESHOLD));
    }
    if BOTTOM_RAIL >= TOP_RAIL || TOP_RAIL > ADC_MAX {
        return invalid("BOTTOM_RAIL/TOP_RAIL", format!("{}..{} is not a rail band inside 0..={}", BOTTOM_RAIL, TOP_RAIL, ADC_MAX));
    }
    if !(IBI_MIN_MS > 0.0 && IBI_MIN_MS < IBI_MAX_MS) {
        return invalid("IBI_MIN_MS/IBI_MAX_MS", format!("{}..{} is not a valid interval band", IBI_MIN_MS, IBI_MAX_MS));
    }
    if !(0.0 < IBI_BLEND && IBI_BLEND <= 1.0) {
        return invalid("IBI_BLEND", format!("{} must be in (0, 1]", IBI_BLEND));
    }
    if IBI_OUTLIER_FACTOR <= 1.0 {
        return invalid("IBI_OUTLIER_FACTOR", format!("{} must exceed 1", IBI_OUTLIER_FACTOR));
    }
    if !(0.0 < OBS_DEBOUNCE && OBS_DEBOUNCE < 1.0) {
        return invalid("OBS_DEBOUNCE", format!("{} must be in (0, 1)", OBS_DEBOUNCE));
    }
    if !(0.0 < CONF_RAMP && CONF_RAMP <= 1.0) {
        return invalid("CONF_RAMP", format!("{} must be in (0, 1]", CONF_RAMP));
    }
    if INIT_OBS < 2 {
        return invalid("INIT_OBS", format!("{} cannot bootstrap an interval estimate", INIT_OBS));
    }
    if COAST_MS <= 0.0 {
        return invalid("COAST_MS", format!("{} must be positive", COAST_MS));
    }
    if LOOKAHEAD_MS < 0.0 {
        return invalid("LOOKAHEAD_MS", format!("{} must be non-negative", LOOKAHEAD_MS));
    }
    if UPDATE_HZ == 0 || SAMPLE_PERIOD_MS != (1_000 / UPDATE_HZ as u64) {
        return invalid("UPDATE_HZ", format!("{} Hz does not match a {} ms sample period", UPDATE_HZ, SAMPLE_PERIOD_MS));
    }
    if SENSOR_SLOTS == 0 || (VIRTUAL_ID_BASE as usize) > SENSOR_SLOTS {
        return invalid("SENSOR_SLOTS", format!("{} slots with virtual base {}", SENSOR_SLOTS, VIRTUAL_ID_BASE));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(validate().is_ok(), "shipped constants must pass startup validation");
    }

    #[test]
    fn test_derived_constants_consistent() {
        assert_eq!(SAMPLE_PERIOD_MS * UPDATE_HZ as u64, 1_000);
        assert_eq!(MAD_WINDOW as u64 * SAMPLE_PERIOD_MS, 2_000, "window should cover 2 s");
        // The IBI band is exactly the advertised 45..150 BPM range.
        assert!((60_000.0 / IBI_MAX_MS - 45.0).abs() < 0.1);
        assert!((60_000.0 / IBI_MIN_MS - 150.0).abs() < 0.1);
    }
}
