use std::collections::BTreeMap;

use ensemble_core::stats::{ratio, sanitize_unit};
use ensemble_core::{EnsembleError, EnsembleResult, ModelResult};
use serde::{Deserialize, Serialize};

/// Weighted combination of per-model outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendedPrediction {
    pub win_probability: f64,
    pub raw_confidence: f64,
    /// Filled in by the service from the calibration engine
    pub calibrated_confidence: f64,
    /// Weight actually applied to each contributing model, summing to 1.0
    pub weights_used: BTreeMap<String, f64>,
    pub model_results: Vec<ModelResult>,
}

/// Weighted average of probabilities and confidences. Models without a
/// current weight get `default_weight`; the applied weights are renormalized
/// over the models present.
pub fn blend_results(
    weights: &BTreeMap<String, f64>,
    default_weight: f64,
    results: &[ModelResult],
) -> EnsembleResult<BlendedPrediction> {
    if results.is_empty() {
        return Err(EnsembleError::InvalidInput("no model results to blend".to_string()));
    }

    let raw: Vec<f64> = results
        .iter()
        .map(|r| weights.get(&r.model_name).copied().unwrap_or(default_weight).max(0.0))
        .collect();
    let total: f64 = raw.iter().sum();
    let uniform = 1.0 / results.len() as f64;
    let applied: Vec<f64> = raw.iter().map(|w| ratio(*w, total, uniform)).collect();

    let mut win_probability = 0.0;
    let mut raw_confidence = 0.0;
    let mut weights_used = BTreeMap::new();
    for (result, weight) in results.iter().zip(&applied) {
        win_probability += weight * sanitize_unit(result.win_probability);
        raw_confidence += weight * sanitize_unit(result.confidence);
        *weights_used.entry(result.model_name.clone()).or_insert(0.0) += weight;
    }

    Ok(BlendedPrediction {
        win_probability,
        raw_confidence,
        calibrated_confidence: raw_confidence,
        weights_used,
        model_results: results.to_vec(),
    })
}
