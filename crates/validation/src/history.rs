//! Long-retention prediction log consumed by cross-validation.
//!
//! Unlike the tracker's 100-record window this log keeps every prediction
//! whose game falls inside the retention window, up to a hard entry cap.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use ensemble_core::{EnsembleError, EnsembleResult, GameOutcome, ModelResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPrediction {
    pub prediction_id: String,
    pub game_date: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    pub predicted_winner: String,
    /// Ensemble probability that `predicted_winner` wins
    pub win_probability: f64,
    /// Uncalibrated ensemble confidence
    pub raw_confidence: f64,
    #[serde(default)]
    pub model_results: Vec<ModelResult>,
    /// None until the game is completed
    pub actual_winner: Option<String>,
    #[serde(default)]
    pub context_tags: BTreeSet<String>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoricalPrediction {
    pub fn from_outcome(outcome: &GameOutcome, recorded_at: DateTime<Utc>) -> Self {
        Self {
            prediction_id: outcome.prediction_id.clone(),
            game_date: outcome.game_date,
            home_team: outcome.home_team.clone(),
            away_team: outcome.away_team.clone(),
            predicted_winner: outcome.predicted_winner.clone(),
            win_probability: outcome.win_probability,
            raw_confidence: outcome.overall_confidence,
            model_results: outcome.model_results.clone(),
            actual_winner: Some(outcome.actual_winner.clone()),
            context_tags: outcome.context_tags.clone(),
            recorded_at,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.actual_winner.as_deref().is_some_and(|w| !w.trim().is_empty())
    }

    /// Whether the predicted winner won; None while the game is pending.
    pub fn is_correct(&self) -> Option<bool> {
        self.actual_winner
            .as_deref()
            .filter(|w| !w.trim().is_empty())
            .map(|w| w == self.predicted_winner)
    }

    pub fn predicted_home(&self) -> bool {
        self.predicted_winner == self.home_team
    }

    pub fn actual_home(&self) -> Option<bool> {
        self.actual_winner.as_deref().map(|w| w == self.home_team)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalLog {
    retention_days: i64,
    max_entries: usize,
    entries: Vec<HistoricalPrediction>,
}

impl Default for HistoricalLog {
    fn default() -> Self {
        Self::new(365, 5_000)
    }
}

impl HistoricalLog {
    pub fn new(retention_days: i64, max_entries: usize) -> Self {
        Self {
            retention_days,
            max_entries,
            entries: Vec::new(),
        }
    }

    /// Restore persisted entries under the current retention settings.
    pub fn from_entries(
        retention_days: i64,
        max_entries: usize,
        entries: Vec<HistoricalPrediction>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut log = Self {
            retention_days,
            max_entries,
            entries,
        };
        log.prune(now);
        log
    }

    /// Add or update a prediction. A known `prediction_id` is replaced in place
    /// so a pending prediction can later be completed.
    pub fn add(&mut self, prediction: HistoricalPrediction, now: DateTime<Utc>) -> EnsembleResult<()> {
        if prediction.prediction_id.trim().is_empty() {
            return Err(EnsembleError::InvalidInput(
                "historical prediction has no prediction_id".to_string(),
            ));
        }
        match self
            .entries
            .iter_mut()
            .find(|e| e.prediction_id == prediction.prediction_id)
        {
            Some(existing) => *existing = prediction,
            None => self.entries.push(prediction),
        }
        self.prune(now);
        Ok(())
    }

    /// Drop games older than the retention window, then the oldest entries
    /// beyond the size cap. A window reaching past the representable date
    /// range keeps every game.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = TimeDelta::try_days(self.retention_days).and_then(|window| now.checked_sub_signed(window));
        let before = self.entries.len();
        if let Some(cutoff) = cutoff {
            self.entries.retain(|e| e.game_date > cutoff);
        }
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
        }
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, remaining = self.entries.len(), "pruned historical predictions");
        }
    }

    pub fn entries(&self) -> &[HistoricalPrediction] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_completed()).count()
    }

    /// Point-in-time copy of the label-known predictions.
    pub fn completed(&self) -> Vec<HistoricalPrediction> {
        self.entries.iter().filter(|e| e.is_completed()).cloned().collect()
    }
}
