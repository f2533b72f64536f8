//! Model Performance Tracker
//!
//! Keeps a bounded, FIFO window of outcome records per model and derives the
//! statistics the weight calculator consumes: overall and recent accuracy,
//! recency-weighted accuracy, velocity, calibration gap and per-context accuracy.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use ensemble_core::stats::{hit_rate, mean, ratio, sanitize_unit};
use ensemble_core::{EnsembleError, EnsembleResult, OutcomeRecord};
use serde::{Deserialize, Serialize};

/// Appends between full recomputations of the recency sums.
const RESYNC_INTERVAL: u32 = 64;

/// Tuning for the per-model history window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Maximum records kept per model (oldest evicted first)
    pub history_cap: usize,
    /// Size of the "recent" accuracy window
    pub recent_window: usize,
    /// Recency decay per position: weight = decay_rate^distance_from_newest
    pub decay_rate: f64,
    /// EMA factor for per-context accuracy
    pub context_alpha: f64,
    /// Samples a context needs before it influences scoring
    pub min_context_samples: u64,
    /// Records needed before velocity is reported
    pub velocity_min_records: usize,
    /// Velocity is clamped to +/- this value
    pub velocity_limit: f64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            history_cap: 100,
            recent_window: 20,
            decay_rate: 0.95,
            context_alpha: 0.1,
            min_context_samples: 5,
            velocity_min_records: 10,
            velocity_limit: 0.5,
        }
    }
}

/// Exponentially smoothed accuracy within one context tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPerformance {
    pub accuracy: f64,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
}

/// Statistics for the last `window_size` predictions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub window_size: usize,
    pub predictions: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub avg_confidence: f64,
    /// Mean of `1 - |confidence - outcome|`
    pub confidence_accuracy: f64,
}

/// Running sums behind the recency-weighted accuracy.
#[derive(Debug, Clone, Default, PartialEq)]
struct RecencySums {
    weighted_correct: f64,
    weight_total: f64,
    appends_since_resync: u32,
}

/// Per-model state. Created on the first outcome, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPerformanceState {
    pub model_name: String,
    pub history: VecDeque<OutcomeRecord>,
    #[serde(default)]
    pub contextual: BTreeMap<String, ContextPerformance>,
    /// Outcomes ever recorded, including evicted ones
    #[serde(default)]
    pub total_predictions: u64,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip)]
    recency: RecencySums,
}

impl ModelPerformanceState {
    fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            history: VecDeque::new(),
            contextual: BTreeMap::new(),
            total_predictions: 0,
            last_updated: None,
            recency: RecencySums::default(),
        }
    }

    pub fn sample_size(&self) -> usize {
        self.history.len()
    }

    /// Accuracy over the whole bounded window.
    pub fn overall_accuracy(&self) -> f64 {
        hit_rate(self.history.iter().map(|r| r.actual_correct))
    }

    /// Accuracy over the newest `window` records.
    pub fn recent_accuracy(&self, window: usize) -> f64 {
        let skip = self.history.len().saturating_sub(window);
        hit_rate(self.history.iter().skip(skip).map(|r| r.actual_correct))
    }

    /// `sum(correct_i * w_i) / sum(w_i)` with `w_i = decay^distance`; 0.0 when empty.
    pub fn weighted_accuracy(&self) -> f64 {
        ratio(self.recency.weighted_correct, self.recency.weight_total, 0.0)
    }

    /// Recent-half accuracy minus older-half accuracy, clamped.
    pub fn velocity(&self, settings: &TrackerSettings) -> f64 {
        if self.history.len() < settings.velocity_min_records.max(2) {
            return 0.0;
        }
        let midpoint = self.history.len() / 2;
        let older = hit_rate(self.history.iter().take(midpoint).map(|r| r.actual_correct));
        let recent = hit_rate(self.history.iter().skip(midpoint).map(|r| r.actual_correct));
        (recent - older).clamp(-settings.velocity_limit, settings.velocity_limit)
    }

    /// Mean confidence minus observed accuracy (positive = overconfident).
    pub fn calibration_gap(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.average_confidence() - self.overall_accuracy()
    }

    pub fn average_confidence(&self) -> f64 {
        let confidences: Vec<f64> = self.history.iter().map(|r| r.predicted_confidence).collect();
        mean(&confidences)
    }

    /// Window average of `1 - |confidence - outcome|`; 1.0 when empty.
    pub fn calibration_bonus(&self) -> f64 {
        if self.history.is_empty() {
            return 1.0;
        }
        let bonuses: Vec<f64> = self.history.iter().map(|r| r.calibration_bonus()).collect();
        mean(&bonuses)
    }

    /// (current streak of correct predictions, longest streak in the window)
    pub fn streaks(&self) -> (usize, usize) {
        let current = self
            .history
            .iter()
            .rev()
            .take_while(|r| r.actual_correct)
            .count();
        let mut longest = 0;
        let mut run = 0;
        for record in &self.history {
            if record.actual_correct {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        (current, longest)
    }

    pub fn window_stats(&self, window_size: usize) -> WindowStats {
        let skip = self.history.len().saturating_sub(window_size);
        let records: Vec<&OutcomeRecord> = self.history.iter().skip(skip).collect();
        if records.is_empty() {
            return WindowStats {
                window_size,
                ..WindowStats::default()
            };
        }
        let n = records.len() as f64;
        let correct = records.iter().filter(|r| r.actual_correct).count();
        WindowStats {
            window_size,
            predictions: records.len(),
            correct,
            accuracy: correct as f64 / n,
            avg_confidence: records.iter().map(|r| r.predicted_confidence).sum::<f64>() / n,
            confidence_accuracy: records.iter().map(|r| r.calibration_bonus()).sum::<f64>() / n,
        }
    }

    /// Per-tag accuracy for tags that have enough samples to matter.
    pub fn qualifying_contexts(&self, min_samples: u64) -> impl Iterator<Item = (&str, f64)> {
        self.contextual
            .iter()
            .filter(move |(_, c)| c.sample_count >= min_samples)
            .map(|(tag, c)| (tag.as_str(), c.accuracy))
    }

    fn push(&mut self, record: OutcomeRecord, settings: &TrackerSettings) {
        let decay = settings.decay_rate;
        let outcome = record.outcome();

        for tag in &record.context_tags {
            match self.contextual.get_mut(tag) {
                Some(ctx) => {
                    ctx.accuracy =
                        settings.context_alpha * outcome + (1.0 - settings.context_alpha) * ctx.accuracy;
                    ctx.sample_count += 1;
                    ctx.last_updated = record.timestamp;
                }
                None => {
                    self.contextual.insert(
                        tag.clone(),
                        ContextPerformance {
                            accuracy: outcome,
                            sample_count: 1,
                            last_updated: record.timestamp,
                        },
                    );
                }
            }
        }

        self.last_updated = Some(record.timestamp);
        self.total_predictions += 1;
        self.history.push_back(record);

        self.recency.weighted_correct = self.recency.weighted_correct * decay + outcome;
        self.recency.weight_total = self.recency.weight_total * decay + 1.0;

        let cap = settings.history_cap.max(1);
        while self.history.len() > cap {
            if let Some(evicted) = self.history.pop_front() {
                // The evicted record sat at distance `cap` from the newest one.
                let w = decay.powi(cap as i32);
                self.recency.weighted_correct -= evicted.outcome() * w;
                self.recency.weight_total -= w;
            }
        }

        self.recency.appends_since_resync += 1;
        if self.recency.appends_since_resync >= RESYNC_INTERVAL {
            self.resync(decay);
        }
    }

    /// Recompute the recency sums from scratch to discard floating-point drift.
    fn resync(&mut self, decay: f64) {
        let mut weighted_correct = 0.0;
        let mut weight_total = 0.0;
        let mut w = 1.0;
        for record in self.history.iter().rev() {
            weighted_correct += record.outcome() * w;
            weight_total += w;
            w *= decay;
        }
        self.recency = RecencySums {
            weighted_correct,
            weight_total,
            appends_since_resync: 0,
        };
    }
}

/// Point-in-time view of one model, for reports and weight reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub model_name: String,
    pub sample_size: usize,
    pub total_predictions: u64,
    pub overall_accuracy: f64,
    pub recent_window_accuracy: f64,
    pub weighted_accuracy: f64,
    pub contextual_accuracy: BTreeMap<String, f64>,
    pub calibration_gap: f64,
    pub velocity: f64,
    pub current_streak: usize,
    pub longest_streak: usize,
    pub last_5: WindowStats,
    pub last_10: WindowStats,
    pub last_20: WindowStats,
    pub last_updated: Option<DateTime<Utc>>,
    /// Live ensemble weight; the tracker leaves this unset
    #[serde(default)]
    pub current_weight: Option<f64>,
    #[serde(default)]
    pub base_weight: Option<f64>,
}

impl PerformanceSummary {
    /// Attach the weights the scheduler currently holds for this model.
    pub fn with_weights(mut self, current: &BTreeMap<String, f64>, base: &BTreeMap<String, f64>) -> Self {
        self.current_weight = current.get(&self.model_name).copied();
        self.base_weight = base.get(&self.model_name).copied();
        self
    }
}

/// Outcome history for every model the ensemble has reported on.
#[derive(Debug, Clone, Default)]
pub struct PerformanceTracker {
    settings: TrackerSettings,
    models: BTreeMap<String, ModelPerformanceState>,
}

impl PerformanceTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            models: BTreeMap::new(),
        }
    }

    /// Rebuild a tracker from persisted states, trimming oversized windows.
    pub fn from_states(settings: TrackerSettings, states: Vec<ModelPerformanceState>) -> Self {
        let mut models = BTreeMap::new();
        for mut state in states {
            if state.model_name.trim().is_empty() {
                continue;
            }
            while state.history.len() > settings.history_cap.max(1) {
                state.history.pop_front();
            }
            state.resync(settings.decay_rate);
            models.insert(state.model_name.clone(), state);
        }
        Self { settings, models }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Append an outcome to the model's window, creating the model on first sight.
    pub fn record_outcome(&mut self, mut record: OutcomeRecord) -> EnsembleResult<&ModelPerformanceState> {
        let name = record.model_name.trim().to_string();
        if name.is_empty() {
            return Err(EnsembleError::InvalidInput("model name is empty".to_string()));
        }
        record.model_name = name.clone();
        record.predicted_probability = sanitize_unit(record.predicted_probability);
        record.predicted_confidence = sanitize_unit(record.predicted_confidence);

        let settings = &self.settings;
        let state = self
            .models
            .entry(name.clone())
            .or_insert_with(|| {
                tracing::info!(model = %name, "tracking new model");
                ModelPerformanceState::new(&name)
            });
        state.push(record, settings);

        tracing::debug!(
            model = %state.model_name,
            samples = state.sample_size(),
            weighted_accuracy = state.weighted_accuracy(),
            "recorded model outcome"
        );
        Ok(state)
    }

    pub fn get(&self, model_name: &str) -> Option<&ModelPerformanceState> {
        self.models.get(model_name)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelPerformanceState> {
        self.models.values()
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Largest per-model outcome count; a proxy for predictions seen overall.
    pub fn total_predictions(&self) -> u64 {
        self.models.values().map(|m| m.total_predictions).max().unwrap_or(0)
    }

    pub fn summary(&self, model_name: &str) -> Option<PerformanceSummary> {
        self.models.get(model_name).map(|state| self.summarize(state))
    }

    pub fn summaries(&self) -> Vec<PerformanceSummary> {
        self.models.values().map(|state| self.summarize(state)).collect()
    }

    /// Recent-window accuracy per model.
    pub fn recent_accuracies(&self) -> BTreeMap<String, f64> {
        self.models
            .iter()
            .map(|(name, state)| (name.clone(), state.recent_accuracy(self.settings.recent_window)))
            .collect()
    }

    /// Cloned states for persistence.
    pub fn export_states(&self) -> Vec<ModelPerformanceState> {
        self.models.values().cloned().collect()
    }

    fn summarize(&self, state: &ModelPerformanceState) -> PerformanceSummary {
        let (current_streak, longest_streak) = state.streaks();
        PerformanceSummary {
            model_name: state.model_name.clone(),
            sample_size: state.sample_size(),
            total_predictions: state.total_predictions,
            overall_accuracy: state.overall_accuracy(),
            recent_window_accuracy: state.recent_accuracy(self.settings.recent_window),
            weighted_accuracy: state.weighted_accuracy(),
            contextual_accuracy: state
                .contextual
                .iter()
                .map(|(tag, c)| (tag.clone(), c.accuracy))
                .collect(),
            calibration_gap: state.calibration_gap(),
            velocity: state.velocity(&self.settings),
            current_streak,
            longest_streak,
            last_5: state.window_stats(5),
            last_10: state.window_stats(10),
            last_20: state.window_stats(20),
            last_updated: state.last_updated,
            current_weight: None,
            base_weight: None,
        }
    }
}
