//! High-level view of the latest cross-validation run.

use chrono::{DateTime, Utc};
use confidence_calibrator::{BinSummary, CalibrationReport};
use serde::{Deserialize, Serialize};

use crate::cross_validation::{CrossValidator, ModelValidationResult, ValidationResult};
use crate::metrics::ConfidenceInterval;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub is_validated: bool,
    pub overall_accuracy: f64,
    /// 1 - expected calibration error of the validated curve
    pub calibration_score: f64,
    pub is_well_calibrated: bool,
    pub total_predictions: usize,
    pub completed_predictions: usize,
    pub validation_folds: usize,
    pub mean_brier_score: f64,
    pub mean_log_loss: f64,
    pub last_validated: Option<DateTime<Utc>>,
    pub confidence_interval: ConfidenceInterval,
    pub model_rankings: Vec<ModelValidationResult>,
    pub calibration_bins: Vec<BinSummary>,
    pub message: String,
}

fn grade(score: f64) -> &'static str {
    if score > 0.9 {
        "Excellent"
    } else if score > 0.8 {
        "Very Good"
    } else if score > 0.7 {
        "Good"
    } else if score > 0.6 {
        "Fair"
    } else {
        "Poor"
    }
}

impl ValidationSummary {
    pub(crate) fn build(validator: &CrossValidator, total_predictions: usize) -> Self {
        let state = validator.state();
        if !validator.is_validated() {
            return Self {
                is_validated: false,
                overall_accuracy: 0.0,
                calibration_score: 0.0,
                is_well_calibrated: false,
                total_predictions,
                completed_predictions: 0,
                validation_folds: 0,
                mean_brier_score: 0.0,
                mean_log_loss: 0.0,
                last_validated: None,
                confidence_interval: ConfidenceInterval::default(),
                model_rankings: Vec::new(),
                calibration_bins: Vec::new(),
                message: "Cross-validation not yet performed".to_string(),
            };
        }

        let report = state
            .curve
            .as_ref()
            .map(|curve| CalibrationReport::from_curve(curve, false));
        let calibration_score = report
            .as_ref()
            .map(|r| (1.0 - r.expected_calibration_error).max(0.0))
            .unwrap_or(0.0);
        let overall_accuracy = validator.overall_accuracy();
        let folds = state.results.len();
        let fold_mean = |f: fn(&ValidationResult) -> f64| {
            state.results.iter().map(f).sum::<f64>() / folds as f64
        };

        Self {
            is_validated: true,
            overall_accuracy,
            calibration_score,
            is_well_calibrated: calibration_score > 0.9,
            total_predictions,
            completed_predictions: state.completed_predictions,
            validation_folds: folds,
            mean_brier_score: fold_mean(|r| r.brier_score),
            mean_log_loss: fold_mean(|r| r.log_loss),
            last_validated: state.last_validated,
            confidence_interval: validator.overall_confidence_interval(),
            model_rankings: validator.model_rankings(),
            calibration_bins: report.map(|r| r.bins).unwrap_or_default(),
            message: format!(
                "Validation Complete: {} accuracy ({:.1}%), {} calibration ({:.1}%) across {} folds",
                grade(overall_accuracy),
                overall_accuracy * 100.0,
                grade(calibration_score),
                calibration_score * 100.0,
                folds
            ),
        }
    }
}
