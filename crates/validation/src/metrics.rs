//! Fold-level scoring: accuracy, per-class precision/recall, probabilistic
//! losses and binomial significance.

use ensemble_core::stats::{brier, f1_score, hit_rate, log_loss, mean, ratio, sanitize_unit};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::history::HistoricalPrediction;

/// z used when the standard normal cannot be constructed.
const FALLBACK_Z_95: f64 = 1.96;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub confidence_level: f64,
}

impl ConfidenceInterval {
    /// Normal approximation to the binomial: `p ± z * sqrt(p(1-p)/n)`, clipped to [0, 1].
    pub fn binomial(p: f64, n: usize, confidence_level: f64) -> Self {
        if n == 0 {
            return Self {
                lower: 0.0,
                upper: 1.0,
                confidence_level,
            };
        }
        let margin = z_for_level(confidence_level) * (p * (1.0 - p) / n as f64).sqrt();
        Self {
            lower: (p - margin).max(0.0),
            upper: (p + margin).min(1.0),
            confidence_level,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

fn standard_normal() -> Option<Normal> {
    Normal::new(0.0, 1.0).ok()
}

/// Two-sided critical value for `confidence_level` (1.96 at 0.95).
pub fn z_for_level(confidence_level: f64) -> f64 {
    let level = confidence_level.clamp(0.5, 0.9999);
    standard_normal()
        .map(|n| n.inverse_cdf(1.0 - (1.0 - level) / 2.0))
        .unwrap_or(FALLBACK_Z_95)
}

/// Two-sided p-value of observing `accuracy` over `n` trials if the true
/// rate were a coin flip.
pub fn p_value_vs_coin_flip(accuracy: f64, n: usize) -> f64 {
    if n == 0 {
        return 1.0;
    }
    let se = (0.25 / n as f64).sqrt();
    let z = (accuracy - 0.5) / se;
    standard_normal()
        .map(|normal| (2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0))
        .unwrap_or(1.0)
}

/// Precision/recall/F1 for one side of the matchup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl ClassMetrics {
    fn from_counts(true_positive: usize, predicted: usize, actual: usize) -> Self {
        let precision = ratio(true_positive as f64, predicted as f64, 0.0);
        let recall = ratio(true_positive as f64, actual as f64, 0.0);
        Self {
            precision,
            recall,
            f1: f1_score(precision, recall),
        }
    }
}

/// Aggregate scores over a set of completed predictions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeScores {
    pub samples: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub home: ClassMetrics,
    pub away: ClassMetrics,
    pub brier_score: f64,
    pub log_loss: f64,
    /// Mean |win_probability - outcome|
    pub mean_calibration_error: f64,
}

impl OutcomeScores {
    /// Score completed predictions; pending ones are ignored.
    pub fn score(predictions: &[HistoricalPrediction]) -> Self {
        let resolved: Vec<(&HistoricalPrediction, bool)> = predictions
            .iter()
            .filter_map(|p| p.is_correct().map(|c| (p, c)))
            .collect();
        if resolved.is_empty() {
            return Self::default();
        }

        let correct = resolved.iter().filter(|(_, c)| *c).count();
        let accuracy = hit_rate(resolved.iter().map(|(_, c)| *c));

        let mut home_tp = 0;
        let mut home_pred = 0;
        let mut home_actual = 0;
        let mut away_tp = 0;
        let mut away_pred = 0;
        let mut away_actual = 0;
        for (p, _) in &resolved {
            let predicted_home = p.predicted_home();
            let actual_home = p.actual_home().unwrap_or(false);
            match (predicted_home, actual_home) {
                (true, true) => home_tp += 1,
                (false, false) => away_tp += 1,
                _ => {}
            }
            if predicted_home {
                home_pred += 1;
            } else {
                away_pred += 1;
            }
            if actual_home {
                home_actual += 1;
            } else {
                away_actual += 1;
            }
        }

        let probs: Vec<(f64, bool)> = resolved
            .iter()
            .map(|(p, c)| (sanitize_unit(p.win_probability), *c))
            .collect();
        let brier_terms: Vec<f64> = probs.iter().map(|&(p, c)| brier(p, c)).collect();
        let log_terms: Vec<f64> = probs.iter().map(|&(p, c)| log_loss(p, c)).collect();
        let error_terms: Vec<f64> = probs
            .iter()
            .map(|&(p, c)| (p - if c { 1.0 } else { 0.0 }).abs())
            .collect();

        Self {
            samples: resolved.len(),
            correct,
            accuracy,
            home: ClassMetrics::from_counts(home_tp, home_pred, home_actual),
            away: ClassMetrics::from_counts(away_tp, away_pred, away_actual),
            brier_score: mean(&brier_terms),
            log_loss: mean(&log_terms),
            mean_calibration_error: mean(&error_terms),
        }
    }
}
