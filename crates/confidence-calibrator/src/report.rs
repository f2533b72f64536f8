//! Calibration diagnostics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bins::CalibrationCurve;

/// Bias beyond this (in either direction) is reported as mis-calibration.
const BIAS_TOLERANCE: f64 = 0.05;

/// Direction of the overall calibration bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasDirection {
    /// Outcomes were worse than the stated confidence
    Overconfident,
    /// Outcomes were better than the stated confidence
    Underconfident,
    WellCalibrated,
}

impl BiasDirection {
    pub fn from_bias(bias: f64) -> Self {
        if bias > BIAS_TOLERANCE {
            BiasDirection::Underconfident
        } else if bias < -BIAS_TOLERANCE {
            BiasDirection::Overconfident
        } else {
            BiasDirection::WellCalibrated
        }
    }
}

impl fmt::Display for BiasDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BiasDirection::Overconfident => write!(f, "overconfident"),
            BiasDirection::Underconfident => write!(f, "underconfident"),
            BiasDirection::WellCalibrated => write!(f, "well-calibrated"),
        }
    }
}

/// One row of the reliability table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinSummary {
    pub label: String,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub predicted: f64,
    pub actual: f64,
    pub gap: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub total_samples: u64,
    pub overall_bias: f64,
    pub bias_direction: BiasDirection,
    pub reliability: f64,
    /// Expected Calibration Error (lower is better)
    pub expected_calibration_error: f64,
    /// Maximum Calibration Error
    pub max_calibration_error: f64,
    pub assessment: String,
    /// True while calibrate_confidence still applies the cold-start deflation
    pub cold_start: bool,
    pub bins: Vec<BinSummary>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl CalibrationReport {
    /// Metrics are recomputed from the bins so the report never lags the
    /// periodic refresh.
    pub fn from_curve(curve: &CalibrationCurve, cold_start: bool) -> Self {
        let mut fresh = curve.clone();
        fresh.refresh_metrics(curve.last_updated.unwrap_or_else(Utc::now));

        let ece = fresh.expected_calibration_error();
        let bins = fresh
            .bins
            .iter()
            .filter(|b| b.sample_count > 0)
            .map(|b| BinSummary {
                label: b.label(),
                min_confidence: b.min_confidence,
                max_confidence: b.max_confidence,
                predicted: b.mean_predicted,
                actual: b.actual_accuracy,
                gap: b.calibration_gap,
                samples: b.sample_count,
            })
            .collect();

        Self {
            total_samples: fresh.total_samples,
            overall_bias: fresh.overall_bias,
            bias_direction: BiasDirection::from_bias(fresh.overall_bias),
            reliability: fresh.reliability,
            expected_calibration_error: ece,
            max_calibration_error: fresh.max_calibration_error(),
            assessment: assess(ece, fresh.total_samples),
            cold_start,
            bins,
            last_updated: curve.last_updated,
        }
    }
}

fn assess(ece: f64, samples: u64) -> String {
    if samples == 0 {
        "Insufficient data - no outcomes recorded yet".to_string()
    } else if ece < 0.05 {
        "Excellent calibration".to_string()
    } else if ece < 0.10 {
        "Good calibration".to_string()
    } else if ece < 0.15 {
        "Fair calibration - consider rebuilding the curve".to_string()
    } else {
        "Poor calibration - confidences do not match outcomes".to_string()
    }
}

impl fmt::Display for CalibrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CONFIDENCE CALIBRATION REPORT")?;
        writeln!(f)?;
        writeln!(f, "Total Samples: {}", self.total_samples)?;
        writeln!(f, "Overall Bias: {:.2}% ({})", self.overall_bias * 100.0, self.bias_direction)?;
        writeln!(f, "Reliability Score: {:.1}%", self.reliability * 100.0)?;
        writeln!(
            f,
            "Calibration Error: expected {:.1}%, max {:.1}%",
            self.expected_calibration_error * 100.0,
            self.max_calibration_error * 100.0
        )?;
        writeln!(f, "Assessment: {}", self.assessment)?;
        if self.cold_start {
            writeln!(f, "Cold start: raw confidences are deflated until enough outcomes arrive")?;
        }
        writeln!(f)?;
        writeln!(f, "Calibration by Confidence Range:")?;
        for bin in &self.bins {
            writeln!(
                f,
                "  {}: Predicted {:.1}%, Actual {:.1}% ({} samples)",
                bin.label,
                bin.predicted * 100.0,
                bin.actual * 100.0,
                bin.samples
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bias_direction() {
        assert_eq!(BiasDirection::from_bias(-0.2), BiasDirection::Overconfident);
        assert_eq!(BiasDirection::from_bias(0.08), BiasDirection::Underconfident);
        assert_eq!(BiasDirection::from_bias(0.01), BiasDirection::WellCalibrated);
    }

    #[test]
    fn test_report_rendering() {
        let samples: Vec<(f64, bool)> = (0..20).map(|i| (0.85, i % 2 == 0)).collect();
        let curve = CalibrationCurve::rebuild(&samples, 0.5, 1.0, 5, Utc::now());
        let report = CalibrationReport::from_curve(&curve, false);

        assert_eq!(report.total_samples, 20);
        assert_eq!(report.bias_direction, BiasDirection::Overconfident);
        assert_eq!(report.bins.len(), 1);
        assert!(report.assessment.starts_with("Poor"));

        let text = report.to_string();
        assert!(text.contains("Total Samples: 20"));
        assert!(text.contains("(overconfident)"));
        assert!(text.contains("80-90%: Predicted 85.0%, Actual 50.0% (20 samples)"));
    }

    #[test]
    fn test_empty_report() {
        let report = CalibrationReport::from_curve(&CalibrationCurve::default(), true);
        assert_eq!(report.total_samples, 0);
        assert!(report.bins.is_empty());
        assert!(report.assessment.starts_with("Insufficient"));
        assert!(report.to_string().contains("Cold start"));
    }
}
