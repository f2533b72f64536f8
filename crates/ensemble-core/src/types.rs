use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, EnsembleResult};

/// One model's contribution to an ensemble prediction.
///
/// `win_probability` is the model's probability that the ensemble's predicted
/// winner wins; a value of at least 0.5 means the model agrees with the pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub model_name: String,
    pub win_probability: f64,
    pub confidence: f64,
}

impl ModelResult {
    pub fn new(model_name: impl Into<String>, win_probability: f64, confidence: f64) -> Self {
        Self {
            model_name: model_name.into(),
            win_probability,
            confidence,
        }
    }

    /// Whether this model backed the ensemble's predicted winner.
    pub fn backs_predicted_winner(&self) -> bool {
        self.win_probability >= 0.5
    }

    /// Whether this model was right, given whether the ensemble pick won.
    pub fn was_correct(&self, ensemble_pick_won: bool) -> bool {
        self.backs_predicted_winner() == ensemble_pick_won
    }
}

/// "Game completed" event delivered by the results collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameOutcome {
    pub prediction_id: String,
    pub game_date: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub model_results: Vec<ModelResult>,
    pub predicted_winner: String,
    /// Ensemble probability assigned to `predicted_winner`.
    pub win_probability: f64,
    /// Raw (uncalibrated) ensemble confidence.
    pub overall_confidence: f64,
    pub actual_winner: String,
    #[serde(default)]
    pub context_tags: BTreeSet<String>,
}

impl GameOutcome {
    pub fn ensemble_correct(&self) -> bool {
        self.predicted_winner == self.actual_winner
    }

    /// Reject events the downstream statistics cannot use.
    pub fn validate(&self) -> EnsembleResult<()> {
        if self.prediction_id.trim().is_empty() {
            return Err(EnsembleError::InvalidInput("prediction_id is empty".to_string()));
        }
        if self.predicted_winner.trim().is_empty() || self.actual_winner.trim().is_empty() {
            return Err(EnsembleError::InvalidInput(format!(
                "prediction {} is missing a winner",
                self.prediction_id
            )));
        }
        if let Some(bad) = self.model_results.iter().find(|r| r.model_name.trim().is_empty()) {
            return Err(EnsembleError::InvalidInput(format!(
                "prediction {} has a model result without a name (p={:.3})",
                self.prediction_id, bad.win_probability
            )));
        }
        Ok(())
    }
}

/// A single model outcome held in a tracker's bounded window.
///
/// Recency weight is not stored; it is derived from the record's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub timestamp: DateTime<Utc>,
    pub model_name: String,
    pub predicted_probability: f64,
    pub predicted_confidence: f64,
    pub actual_correct: bool,
    #[serde(default)]
    pub context_tags: BTreeSet<String>,
}

impl OutcomeRecord {
    pub fn outcome(&self) -> f64 {
        if self.actual_correct {
            1.0
        } else {
            0.0
        }
    }

    /// `1 - |confidence - outcome|`: rewards confidence that matched the result.
    pub fn calibration_bonus(&self) -> f64 {
        1.0 - (self.predicted_confidence - self.outcome()).abs()
    }
}

/// Output of a single prediction model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub probability: f64,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> GameOutcome {
        GameOutcome {
            prediction_id: "2024-10-12-UTA-CHI".to_string(),
            game_date: Utc::now(),
            home_team: "UTA".to_string(),
            away_team: "CHI".to_string(),
            model_results: vec![
                ModelResult::new("Elo Rating", 0.62, 0.7),
                ModelResult::new("Poisson Regression", 0.44, 0.6),
            ],
            predicted_winner: "UTA".to_string(),
            win_probability: 0.58,
            overall_confidence: 0.66,
            actual_winner: "UTA".to_string(),
            context_tags: BTreeSet::new(),
        }
    }

    #[test]
    fn test_model_correctness_follows_pick() {
        let event = outcome();
        assert!(event.ensemble_correct());
        assert!(event.model_results[0].was_correct(true));
        assert!(!event.model_results[1].was_correct(true));
        assert!(event.model_results[1].was_correct(false));
    }

    #[test]
    fn test_validate_rejects_blank_model_name() {
        let mut event = outcome();
        assert!(event.validate().is_ok());
        event.model_results.push(ModelResult::new("  ", 0.5, 0.5));
        assert!(matches!(event.validate(), Err(EnsembleError::InvalidInput(_))));
    }

    #[test]
    fn test_calibration_bonus() {
        let record = OutcomeRecord {
            timestamp: Utc::now(),
            model_name: "Elo Rating".to_string(),
            predicted_probability: 0.7,
            predicted_confidence: 0.8,
            actual_correct: false,
            context_tags: BTreeSet::new(),
        };
        approx::assert_abs_diff_eq!(record.calibration_bonus(), 0.2, epsilon = 1e-12);
    }
}
