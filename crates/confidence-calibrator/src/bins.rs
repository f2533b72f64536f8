//! Confidence bins and the calibration curve built from them.
//!
//! Bins partition `[lower, upper)` contiguously. Values outside the declared
//! range land in the nearest edge bin, so every input maps to exactly one bin.

use chrono::{DateTime, Utc};
use ensemble_core::stats::{ratio, sanitize_unit};
use serde::{Deserialize, Serialize};

/// Running statistics for one confidence range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBin {
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub sample_count: u64,
    /// Running mean of the confidences recorded in this bin
    pub mean_predicted: f64,
    /// Running fraction of correct outcomes
    pub actual_accuracy: f64,
    /// actual_accuracy - mean_predicted (negative means overconfident)
    pub calibration_gap: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ConfidenceBin {
    pub fn new(min_confidence: f64, max_confidence: f64) -> Self {
        Self {
            min_confidence,
            max_confidence,
            sample_count: 0,
            mean_predicted: (min_confidence + max_confidence) / 2.0,
            actual_accuracy: 0.0,
            calibration_gap: 0.0,
            last_updated: None,
        }
    }

    pub fn contains(&self, confidence: f64) -> bool {
        confidence >= self.min_confidence && confidence < self.max_confidence
    }

    pub fn label(&self) -> String {
        format!("{:.0}-{:.0}%", self.min_confidence * 100.0, self.max_confidence * 100.0)
    }

    pub fn abs_error(&self) -> f64 {
        (self.mean_predicted - self.actual_accuracy).abs()
    }

    /// Incremental mean update: `new = (old * n + x) / (n + 1)`.
    pub fn record(&mut self, confidence: f64, correct: bool, now: DateTime<Utc>) {
        let n = self.sample_count as f64;
        let outcome = if correct { 1.0 } else { 0.0 };
        self.mean_predicted = (self.mean_predicted * n + confidence) / (n + 1.0);
        self.actual_accuracy = (self.actual_accuracy * n + outcome) / (n + 1.0);
        self.sample_count += 1;
        self.calibration_gap = self.actual_accuracy - self.mean_predicted;
        self.last_updated = Some(now);
    }
}

/// Ordered bins plus aggregate reliability metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCurve {
    pub bins: Vec<ConfidenceBin>,
    /// Sample-weighted mean gap across non-empty bins
    pub overall_bias: f64,
    /// max(0, 1 - 2 * sample-weighted mean absolute error)
    pub reliability: f64,
    pub total_samples: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for CalibrationCurve {
    fn default() -> Self {
        Self::uniform(0.5, 1.0, 5)
    }
}

impl CalibrationCurve {
    /// `bin_count` equal-width bins over `[lower, upper)`.
    ///
    /// Degenerate arguments fall back to a single bin or to `[0, 1)`.
    pub fn uniform(lower: f64, upper: f64, bin_count: usize) -> Self {
        let (lower, upper) = if lower.is_finite() && upper.is_finite() && lower < upper {
            (lower, upper)
        } else {
            tracing::warn!(lower, upper, "invalid calibration range, using [0, 1)");
            (0.0, 1.0)
        };
        let count = bin_count.max(1);
        let width = upper - lower;
        let edges: Vec<f64> = (0..=count)
            .map(|i| if i == count { upper } else { lower + width * i as f64 / count as f64 })
            .collect();
        let bins = edges.windows(2).map(|e| ConfidenceBin::new(e[0], e[1])).collect();
        Self {
            bins,
            overall_bias: 0.0,
            reliability: 0.0,
            total_samples: 0,
            last_updated: None,
        }
    }

    /// Fresh curve over the given samples; metrics are computed once at the end.
    pub fn rebuild(samples: &[(f64, bool)], lower: f64, upper: f64, bin_count: usize, now: DateTime<Utc>) -> Self {
        let mut curve = Self::uniform(lower, upper, bin_count);
        for &(confidence, correct) in samples {
            curve.record(confidence, correct, now);
        }
        curve.refresh_metrics(now);
        curve
    }

    pub fn lower(&self) -> f64 {
        self.bins.first().map(|b| b.min_confidence).unwrap_or(0.0)
    }

    pub fn upper(&self) -> f64 {
        self.bins.last().map(|b| b.max_confidence).unwrap_or(1.0)
    }

    /// True when the bins are non-empty, ordered and share their edges.
    pub fn is_contiguous(&self) -> bool {
        !self.bins.is_empty()
            && self.bins.iter().all(|b| b.min_confidence < b.max_confidence)
            && self
                .bins
                .windows(2)
                .all(|pair| pair[0].max_confidence == pair[1].min_confidence)
    }

    /// Index of the bin for `confidence`, clamping to the edge bins.
    pub fn bin_index(&self, confidence: f64) -> usize {
        let last = self.bins.len().saturating_sub(1);
        let confidence = sanitize_unit(confidence);
        if confidence < self.lower() {
            return 0;
        }
        self.bins.iter().position(|b| b.contains(confidence)).unwrap_or(last)
    }

    pub fn bin_for(&self, confidence: f64) -> Option<&ConfidenceBin> {
        self.bins.get(self.bin_index(confidence))
    }

    pub fn record(&mut self, confidence: f64, correct: bool, now: DateTime<Utc>) {
        let confidence = sanitize_unit(confidence);
        let index = self.bin_index(confidence);
        if let Some(bin) = self.bins.get_mut(index) {
            bin.record(confidence, correct, now);
        }
    }

    /// Live sample count across bins (independent of the metric refresh cadence).
    pub fn sample_count(&self) -> u64 {
        self.bins.iter().map(|b| b.sample_count).sum()
    }

    pub fn refresh_metrics(&mut self, now: DateTime<Utc>) {
        let total = self.sample_count();
        let weighted = |f: &dyn Fn(&ConfidenceBin) -> f64| -> f64 {
            let sum: f64 = self
                .bins
                .iter()
                .filter(|b| b.sample_count > 0)
                .map(|b| f(b) * b.sample_count as f64)
                .sum();
            ratio(sum, total as f64, 0.0)
        };
        let bias = weighted(&|b: &ConfidenceBin| b.calibration_gap);
        let mean_abs_error = weighted(&|b: &ConfidenceBin| b.abs_error());

        self.overall_bias = bias;
        self.reliability = if total > 0 { (1.0 - 2.0 * mean_abs_error).max(0.0) } else { 0.0 };
        self.total_samples = total;
        self.last_updated = Some(now);
    }

    /// Sample-weighted mean absolute gap (ECE).
    pub fn expected_calibration_error(&self) -> f64 {
        let total = self.sample_count() as f64;
        let sum: f64 = self.bins.iter().map(|b| b.abs_error() * b.sample_count as f64).sum();
        ratio(sum, total, 0.0)
    }

    /// Largest absolute gap of any non-empty bin (MCE).
    pub fn max_calibration_error(&self) -> f64 {
        self.bins
            .iter()
            .filter(|b| b.sample_count > 0)
            .map(ConfidenceBin::abs_error)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_uniform_bins_are_contiguous() {
        let curve = CalibrationCurve::uniform(0.5, 1.0, 5);
        assert_eq!(curve.bins.len(), 5);
        assert!(curve.is_contiguous());
        assert_eq!(curve.lower(), 0.5);
        assert_eq!(curve.upper(), 1.0);
        assert_eq!(curve.bins[2].label(), "70-80%");
    }

    #[test]
    fn test_out_of_range_clamps_to_edge_bins() {
        let curve = CalibrationCurve::uniform(0.5, 1.0, 5);
        assert_eq!(curve.bin_index(0.2), 0);
        assert_eq!(curve.bin_index(1.0), 4);
        assert_eq!(curve.bin_index(7.0), 4);
        assert_eq!(curve.bin_index(0.65), 1);
    }

    #[test]
    fn test_running_means() {
        let mut bin = ConfidenceBin::new(0.7, 0.8);
        let now = Utc::now();
        bin.record(0.72, true, now);
        bin.record(0.78, false, now);
        assert_eq!(bin.sample_count, 2);
        assert_abs_diff_eq!(bin.mean_predicted, 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(bin.actual_accuracy, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(bin.calibration_gap, -0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_metrics() {
        let now = Utc::now();
        let samples: Vec<(f64, bool)> = (0..10).map(|i| (0.9, i < 6)).collect();
        let curve = CalibrationCurve::rebuild(&samples, 0.5, 1.0, 5, now);
        assert_eq!(curve.total_samples, 10);
        assert_abs_diff_eq!(curve.overall_bias, -0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(curve.reliability, 0.4, epsilon = 1e-9);
        assert_abs_diff_eq!(curve.expected_calibration_error(), 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(curve.max_calibration_error(), 0.3, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_layout_falls_back() {
        let curve = CalibrationCurve::uniform(0.9, 0.1, 0);
        assert_eq!(curve.bins.len(), 1);
        assert_eq!(curve.lower(), 0.0);
        assert_eq!(curve.upper(), 1.0);
    }
}
