//! Confidence Calibration
//!
//! Maps a raw ensemble confidence onto the accuracy that confidence level has
//! historically achieved, using the running statistics of the matching bin.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use ensemble_core::stats::sanitize_unit;
use serde::{Deserialize, Serialize};

use crate::bins::CalibrationCurve;
use crate::report::CalibrationReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Lower edge of the default bin layout
    pub lower_bound: f64,
    /// Upper edge of the default bin layout
    pub upper_bound: f64,
    pub bin_count: usize,
    /// Below this many total samples every confidence is deflated
    pub cold_start_samples: u64,
    pub cold_start_factor: f64,
    /// Samples a bin needs before it overrides the raw confidence
    pub min_bin_samples: u64,
    /// Weight of the observed bin accuracy in the blend
    pub smoothing_factor: f64,
    /// Calibrated output is clamped to [band_floor, band_ceiling]
    pub band_floor: f64,
    pub band_ceiling: f64,
    /// Outcomes between aggregate metric refreshes
    pub metrics_interval: u64,
    /// Recent outcomes kept for rebuilding the curve
    pub log_cap: usize,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            lower_bound: 0.5,
            upper_bound: 1.0,
            bin_count: 5,
            cold_start_samples: 30,
            cold_start_factor: 0.95,
            min_bin_samples: 5,
            smoothing_factor: 0.7,
            band_floor: 0.50,
            band_ceiling: 0.95,
            metrics_interval: 10,
            log_cap: 200,
        }
    }
}

/// A single recorded (confidence, outcome) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub confidence: f64,
    pub correct: bool,
    pub timestamp: DateTime<Utc>,
}

/// Persisted form of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationState {
    pub curve: CalibrationCurve,
    #[serde(default)]
    pub log: VecDeque<CalibrationSample>,
    /// True once a validated curve replaced the default layout
    #[serde(default)]
    pub adopted: bool,
}

#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    settings: CalibrationSettings,
    curve: CalibrationCurve,
    log: VecDeque<CalibrationSample>,
    adopted: bool,
    updates_since_refresh: u64,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(CalibrationSettings::default())
    }
}

impl CalibrationEngine {
    pub fn new(settings: CalibrationSettings) -> Self {
        let curve = CalibrationCurve::uniform(settings.lower_bound, settings.upper_bound, settings.bin_count);
        Self {
            settings,
            curve,
            log: VecDeque::new(),
            adopted: false,
            updates_since_refresh: 0,
        }
    }

    /// Resume from persisted state. A malformed bin layout resets the engine.
    pub fn from_state(settings: CalibrationSettings, state: CalibrationState) -> Self {
        if !state.curve.is_contiguous() {
            tracing::warn!(bins = state.curve.bins.len(), "persisted calibration bins are malformed, starting fresh");
            return Self::new(settings);
        }
        let mut log = state.log;
        while log.len() > settings.log_cap {
            log.pop_front();
        }
        Self {
            settings,
            curve: state.curve,
            log,
            adopted: state.adopted,
            updates_since_refresh: 0,
        }
    }

    pub fn state(&self) -> CalibrationState {
        CalibrationState {
            curve: self.curve.clone(),
            log: self.log.clone(),
            adopted: self.adopted,
        }
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    pub fn curve(&self) -> &CalibrationCurve {
        &self.curve
    }

    pub fn log(&self) -> &VecDeque<CalibrationSample> {
        &self.log
    }

    pub fn is_adopted(&self) -> bool {
        self.adopted
    }

    pub fn total_samples(&self) -> u64 {
        self.curve.sample_count()
    }

    pub fn is_cold(&self) -> bool {
        self.total_samples() < self.settings.cold_start_samples
    }

    /// Calibrated probability for `raw_confidence`, always inside the band.
    ///
    /// Pure with respect to the engine state: repeated calls between two
    /// recorded outcomes return the same value.
    pub fn calibrate(&self, raw_confidence: f64) -> f64 {
        let s = &self.settings;
        let raw = sanitize_unit(raw_confidence);

        let calibrated = if self.is_cold() {
            raw * s.cold_start_factor
        } else {
            match self.curve.bin_for(raw) {
                Some(bin) if bin.sample_count >= s.min_bin_samples => {
                    s.smoothing_factor * bin.actual_accuracy + (1.0 - s.smoothing_factor) * raw
                }
                _ => raw,
            }
        };
        calibrated.clamp(s.band_floor, s.band_ceiling)
    }

    /// Feed one resolved prediction into its bin and the rebuild log.
    pub fn record(&mut self, confidence: f64, correct: bool, now: DateTime<Utc>) {
        let confidence = sanitize_unit(confidence);
        self.log.push_back(CalibrationSample {
            confidence,
            correct,
            timestamp: now,
        });
        while self.log.len() > self.settings.log_cap {
            self.log.pop_front();
        }

        self.curve.record(confidence, correct, now);
        self.updates_since_refresh += 1;
        if self.updates_since_refresh >= self.settings.metrics_interval.max(1) {
            self.curve.refresh_metrics(now);
            self.updates_since_refresh = 0;
            tracing::debug!(
                samples = self.curve.total_samples,
                bias = self.curve.overall_bias,
                reliability = self.curve.reliability,
                "calibration metrics refreshed"
            );
        }
    }

    /// Recompute every bin from the rebuild log, keeping the current layout.
    pub fn rebuild(&mut self, now: DateTime<Utc>) {
        let samples: Vec<(f64, bool)> = self.log.iter().map(|s| (s.confidence, s.correct)).collect();
        self.curve = CalibrationCurve::rebuild(
            &samples,
            self.curve.lower(),
            self.curve.upper(),
            self.curve.bins.len(),
            now,
        );
        self.updates_since_refresh = 0;
        tracing::info!(samples = samples.len(), "calibration curve rebuilt");
    }

    /// Replace the bins with a curve built by cross-validation.
    pub fn adopt_curve(&mut self, curve: CalibrationCurve) {
        if !curve.is_contiguous() {
            tracing::warn!("refusing to adopt a calibration curve with malformed bins");
            return;
        }
        tracing::info!(
            bins = curve.bins.len(),
            samples = curve.sample_count(),
            "adopted validated calibration curve"
        );
        self.curve = curve;
        self.adopted = true;
        self.updates_since_refresh = 0;
    }

    pub fn report(&self) -> CalibrationReport {
        CalibrationReport::from_curve(&self.curve, self.is_cold())
    }
}
