//! Phase-locked rhythm predictor.
//!
//! Maintains a per-sensor metronome (phase, inter-beat interval, confidence)
//! corrected by detector crossings, and emits beat events a fixed lookahead
//! ahead of each predicted beat so downstream consumers can schedule.
//! Observations are corrections, never triggers: beats keep flowing through
//! short dropouts and fade out over `COAST_MS` when the signal is lost.
//!
//! All time arithmetic runs on the coordinator's monotonic millisecond
//! clock; emitted timestamps add the boot-time UTC offset, so a wall-clock
//! step after boot can never perturb the phase math.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::analysis::Crossing;
use crate::tunables::{
    CONF_RAMP, COAST_MS, IBI_BLEND, IBI_MAX_MS, IBI_MIN_MS, IBI_OUTLIER_FACTOR, INIT_OBS,
    LOOKAHEAD_MS, OBS_DEBOUNCE, PHASE_CORR_MAX, PHASE_CORR_WEIGHT,
};

/// A committed, future-timestamped beat prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub ppg_id: u8,
    /// Predicted wall-clock instant of the beat, unix seconds; always at or
    /// after emission time.
    pub t_unix_s: f64,
    pub bpm: f64,
    /// Predictor confidence at emission time, in (0, 1].
    pub intensity: f64,
}

/// Predictor operating mode. The bootstrap intervals live only in `Init`.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictorMode {
    /// Collecting the first observations; no interval estimate yet.
    Init { init_ibis: Vec<f64> },
    /// Phase-locked; observations keep confidence at 1.0.
    Locked,
    /// Observations stopped arriving; emission continues on decaying
    /// confidence.
    Coast,
    /// Confidence reached zero; emission suspended until a new observation
    /// starts a fresh INIT.
    Stop,
}

impl PredictorMode {
    pub fn label(&self) -> &'static str {
        match self {
            PredictorMode::Init { .. } => "init",
            PredictorMode::Locked => "locked",
            PredictorMode::Coast => "coast",
            PredictorMode::Stop => "stop",
        }
    }
}

#[derive(Debug)]
pub struct RhythmPredictor {
    ppg_id: u8,
    /// Unix seconds at monotonic zero, captured once at boot.
    unix_offset_s: f64,
    mode: PredictorMode,
    /// Fractional position within the current cardiac cycle, [0, 1).
    phase: f64,
    /// Current inter-beat interval estimate; 0 until the first lock.
    ibi_ms: f64,
    confidence: f64,
    last_obs_ms: Option<u64>,
    last_tick_ms: Option<u64>,
    last_beat_ms: u64,
    beat_emitted_this_cycle: bool,
    /// Monotonicity floor for emitted timestamps.
    last_emitted_unix_s: f64,
}

impl RhythmPredictor {
    pub fn new(ppg_id: u8, unix_offset_s: f64) -> Self {
        Self {
            ppg_id,
            unix_offset_s,
            mode: PredictorMode::Init { init_ibis: Vec::new() },
            phase: 0.0,
            ibi_ms: 0.0,
            confidence: 0.0,
            last_obs_ms: None,
            last_tick_ms: None,
            last_beat_ms: 0,
            beat_emitted_this_cycle: false,
            last_emitted_unix_s: 0.0,
        }
    }

    pub fn mode(&self) -> &PredictorMode {
        &self.mode
    }

    pub fn ibi_ms(&self) -> f64 {
        self.ibi_ms
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Feed a detector crossing as a rhythm correction.
    pub fn observe(&mut self, crossing: &Crossing) {
        let now_ms = crossing.t_ms;

        if matches!(self.mode, PredictorMode::Stop) {
            // Fresh INIT; this observation counts as the first.
            self.mode = PredictorMode::Init { init_ibis: Vec::new() };
            self.confidence = CONF_RAMP;
            self.last_obs_ms = Some(now_ms);
            debug!(ppg_id = self.ppg_id, "observation after stop; restarting init");
            return;
        }

        // Debounce against double-fires (dicrotic notches, threshold
        // chatter). Inert until an interval estimate exists.
        if let Some(last) = self.last_obs_ms {
            let elapsed_ms = now_ms.saturating_sub(last) as f64;
            if elapsed_ms < OBS_DEBOUNCE * self.ibi_ms {
                trace!(ppg_id = self.ppg_id, elapsed_ms, "observation debounced");
                return;
            }
        }

        match &mut self.mode {
            PredictorMode::Init { init_ibis } => {
                if let Some(last) = self.last_obs_ms {
                    init_ibis.push(now_ms.saturating_sub(last) as f64);
                }
                self.confidence = (self.confidence + CONF_RAMP).min(1.0);

                if init_ibis.len() + 1 >= INIT_OBS {
                    let mut ibis = init_ibis.clone();
                    ibis.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    let median = ibis[(ibis.len() - 1) / 2];
                    self.ibi_ms = median.clamp(IBI_MIN_MS, IBI_MAX_MS);
                    // The fifth crossing just happened: the cycle starts here.
                    self.phase = 0.0;
                    self.beat_emitted_this_cycle = false;
                    self.confidence = 1.0;
                    self.mode = PredictorMode::Locked;
                    debug!(ppg_id = self.ppg_id, ibi_ms = self.ibi_ms, "rhythm locked");
                }
                self.last_obs_ms = Some(now_ms);
            }

            PredictorMode::Locked | PredictorMode::Coast => {
                let Some(last) = self.last_obs_ms else {
                    // Cleared by a forced coast; re-anchor without an interval.
                    self.last_obs_ms = Some(now_ms);
                    return;
                };
                let observed_ibi = now_ms.saturating_sub(last) as f64;

                if observed_ibi > IBI_MAX_MS
                    || observed_ibi < IBI_MIN_MS
                    || observed_ibi > self.ibi_ms * IBI_OUTLIER_FACTOR
                    || observed_ibi < self.ibi_ms / IBI_OUTLIER_FACTOR
                {
                    debug!(
                        ppg_id = self.ppg_id,
                        observed_ibi,
                        ibi_ms = self.ibi_ms,
                        "observation rejected as outlier"
                    );
                    return;
                }

                self.ibi_ms = ((1.0 - IBI_BLEND) * self.ibi_ms + IBI_BLEND * observed_ibi)
                    .clamp(IBI_MIN_MS, IBI_MAX_MS);

                let expected_phase = observed_ibi / self.ibi_ms;
                let err = (expected_phase - self.phase).clamp(-PHASE_CORR_MAX, PHASE_CORR_MAX);
                self.phase += PHASE_CORR_WEIGHT * err;

                if matches!(self.mode, PredictorMode::Coast) {
                    self.confidence = (self.confidence + CONF_RAMP).min(1.0);
                    if self.confidence >= 1.0 {
                        self.mode = PredictorMode::Locked;
                        debug!(ppg_id = self.ppg_id, "rhythm re-locked after coast");
                    }
                }
                self.last_obs_ms = Some(now_ms);
            }

            // Handled by the early return above.
            PredictorMode::Stop => {}
        }
    }

    /// Advance phase by the elapsed wall-clock delta and possibly emit.
    pub fn tick(&mut self, now_ms: u64) -> Option<BeatEvent> {
        let dt_ms = match self.last_tick_ms {
            Some(last) => now_ms.saturating_sub(last) as f64,
            None => 0.0,
        };
        self.last_tick_ms = Some(now_ms);

        match self.mode {
            PredictorMode::Init { .. } | PredictorMode::Stop => return None,
            PredictorMode::Locked => {
                if let Some(last_obs) = self.last_obs_ms {
                    if now_ms.saturating_sub(last_obs) as f64 > self.ibi_ms {
                        self.mode = PredictorMode::Coast;
                        debug!(ppg_id = self.ppg_id, "coasting: observations stopped");
                    }
                }
            }
            PredictorMode::Coast => {}
        }

        if matches!(self.mode, PredictorMode::Coast) {
            self.confidence -= dt_ms / COAST_MS;
            if self.confidence <= 0.0 {
                self.enter_stop();
                return None;
            }
        }

        self.phase += dt_ms / self.ibi_ms;

        // Emit one lookahead ahead of the predicted beat; for very short
        // intervals the emission point clamps to the wrap itself.
        let tau = (1.0 - LOOKAHEAD_MS / self.ibi_ms).max(0.0);
        let mut event = None;
        if self.phase >= tau && !self.beat_emitted_this_cycle && self.confidence > 0.0 {
            event = Some(self.emit(now_ms));
            self.beat_emitted_this_cycle = true;
        }

        if self.phase >= 1.0 {
            // At most one wrap per tick: a stalled scheduler slips the
            // metronome rather than bursting beats.
            self.phase -= 1.0;
            self.beat_emitted_this_cycle = false;
            self.last_beat_ms = now_ms;
        }

        event
    }

    /// Force immediate coasting (detector reset, upstream gap).
    pub fn force_coast(&mut self) {
        match self.mode {
            PredictorMode::Locked => {
                self.mode = PredictorMode::Coast;
                debug!(ppg_id = self.ppg_id, "forced into coast");
            }
            PredictorMode::Init { .. } => {
                // No interval estimate to coast on; drop the observation
                // anchor so the bootstrap never records a gap-spanning
                // interval.
                self.last_obs_ms = None;
            }
            PredictorMode::Coast | PredictorMode::Stop => {}
        }
    }

    fn enter_stop(&mut self) {
        self.confidence = 0.0;
        self.phase = 0.0;
        self.beat_emitted_this_cycle = false;
        self.last_obs_ms = None;
        self.mode = PredictorMode::Stop;
        debug!(ppg_id = self.ppg_id, "confidence exhausted; stopped");
    }

    fn emit(&mut self, now_ms: u64) -> BeatEvent {
        let remaining_ms = ((1.0 - self.phase) * self.ibi_ms).max(0.0);
        let now_unix_s = self.unix_offset_s + now_ms as f64 / 1_000.0;
        let mut t_unix_s = now_unix_s + remaining_ms / 1_000.0;
        if t_unix_s < self.last_emitted_unix_s {
            t_unix_s = self.last_emitted_unix_s;
        }
        self.last_emitted_unix_s = t_unix_s;

        BeatEvent {
            ppg_id: self.ppg_id,
            t_unix_s,
            bpm: 60_000.0 / self.ibi_ms,
            intensity: self.confidence,
        }
    }
}
