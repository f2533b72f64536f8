//! Recalibration Scheduler
//!
//! Owns the live weight state. Counts outcomes since the last trigger, fires
//! the weight calculator when the threshold (or the optional time limit) is
//! reached, and keeps a bounded audit log of every weight change.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::PerformanceTracker;
use crate::weights::{bounded_normalize, WeightCalculator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Outcomes between automatic recalibrations
    pub outcome_threshold: u64,
    /// Also fire when this many seconds passed since the last recalibration
    pub max_interval_secs: Option<i64>,
    /// Snapshots kept in the audit log
    pub audit_log_cap: usize,
    pub auto_recalibrate: bool,
    /// Weight moves above this are called out in the reasoning text
    pub significant_change: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            outcome_threshold: 10,
            max_interval_secs: None,
            audit_log_cap: 100,
            auto_recalibrate: true,
            significant_change: 0.01,
        }
    }
}

/// Base and current weight of every known model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightState {
    pub base: BTreeMap<String, f64>,
    pub current: BTreeMap<String, f64>,
    /// Base weight assigned to a model first seen at runtime
    pub default_base_weight: f64,
}

impl WeightState {
    pub fn new(base: BTreeMap<String, f64>, default_base_weight: f64) -> Self {
        Self {
            current: base.clone(),
            base,
            default_base_weight,
        }
    }
}

impl Default for WeightState {
    fn default() -> Self {
        Self::new(BTreeMap::new(), 0.10)
    }
}

/// One entry of the recalibration audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub timestamp: DateTime<Utc>,
    pub trigger_reason: String,
    pub old_weights: BTreeMap<String, f64>,
    pub new_weights: BTreeMap<String, f64>,
    pub delta: BTreeMap<String, f64>,
    /// Recent-window accuracy per model at the time of the trigger
    pub performance_snapshot: BTreeMap<String, f64>,
    pub reasoning: String,
    pub prediction_count: u64,
    #[serde(default)]
    pub used_base_weights: bool,
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Skipped(String),
    Recalibrated(WeightSnapshot),
}

impl TriggerOutcome {
    pub fn snapshot(&self) -> Option<&WeightSnapshot> {
        match self {
            TriggerOutcome::Recalibrated(snapshot) => Some(snapshot),
            TriggerOutcome::Skipped(_) => None,
        }
    }
}

/// Everything the scheduler persists between restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub weights: WeightState,
    pub history: VecDeque<WeightSnapshot>,
    pub total_recalibrations: u64,
    pub last_recalibration: Option<DateTime<Utc>>,
    pub outcomes_since_trigger: u64,
    /// Sum of per-model outcome counts seen by the previous trigger
    #[serde(default)]
    pub outcomes_at_last_trigger: u64,
}

pub struct RecalibrationScheduler {
    settings: SchedulerSettings,
    calculator: WeightCalculator,
    state: SchedulerState,
}

impl RecalibrationScheduler {
    pub fn new(settings: SchedulerSettings, calculator: WeightCalculator, weights: WeightState) -> Self {
        let state = SchedulerState {
            weights,
            ..SchedulerState::default()
        };
        Self::from_state(settings, calculator, state)
    }

    /// Resume from persisted state. Current weights are brought back inside
    /// the configured bounds in case the constraints changed in between.
    ///
    /// When more models are known than `min_weight` leaves room for, the
    /// lowest-weighted ones stop receiving a weight.
    pub fn from_state(settings: SchedulerSettings, calculator: WeightCalculator, mut state: SchedulerState) -> Self {
        for (model, base) in state.weights.base.clone() {
            state.weights.current.entry(model).or_insert(base);
        }
        let c = calculator.constraints();
        while !c.has_room_for(state.weights.current.len()) {
            let lowest = state
                .weights
                .current
                .iter()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(model, _)| model.clone());
            let Some(model) = lowest else { break };
            state.weights.current.remove(&model);
            tracing::warn!(model = %model, min_weight = c.min_weight, "no room for model under the weight floor, dropped from the ensemble");
        }
        state.weights.current = bounded_normalize(&state.weights.current, c.min_weight, c.max_weight);
        while state.history.len() > settings.audit_log_cap {
            state.history.pop_front();
        }
        Self {
            settings,
            calculator,
            state,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn current_weights(&self) -> &BTreeMap<String, f64> {
        &self.state.weights.current
    }

    pub fn base_weights(&self) -> &BTreeMap<String, f64> {
        &self.state.weights.base
    }

    pub fn history(&self) -> &VecDeque<WeightSnapshot> {
        &self.state.history
    }

    pub fn total_recalibrations(&self) -> u64 {
        self.state.total_recalibrations
    }

    pub fn last_recalibration(&self) -> Option<DateTime<Utc>> {
        self.state.last_recalibration
    }

    pub fn outcomes_since_trigger(&self) -> u64 {
        self.state.outcomes_since_trigger
    }

    /// Give a newly seen model its default base weight. Returns false if it
    /// was already known or if one more `min_weight` floor would push the
    /// total past 1.0; such a model stays unweighted.
    pub fn register_model(&mut self, model_name: &str) -> bool {
        let c = self.calculator.constraints();
        let weights = &mut self.state.weights;
        if weights.current.contains_key(model_name) {
            return false;
        }
        if !c.has_room_for(weights.current.len() + 1) {
            tracing::warn!(
                model = %model_name,
                models = weights.current.len(),
                min_weight = c.min_weight,
                "weight floor leaves no room for another model, not registered"
            );
            return false;
        }
        let default = weights.default_base_weight;
        weights.base.entry(model_name.to_string()).or_insert(default);
        weights.current.insert(model_name.to_string(), default);

        weights.current = bounded_normalize(&weights.current, c.min_weight, c.max_weight);
        tracing::info!(model = %model_name, base_weight = default, "registered model");
        true
    }

    /// Count one recorded game. Returns true when a recalibration is due.
    pub fn note_outcome(&mut self, now: DateTime<Utc>) -> bool {
        self.state.outcomes_since_trigger += 1;
        if !self.settings.auto_recalibrate {
            return false;
        }
        if self.state.outcomes_since_trigger >= self.settings.outcome_threshold {
            return true;
        }
        match (self.settings.max_interval_secs, self.state.last_recalibration) {
            // An interval too large for TimeDelta never elapses.
            (Some(secs), Some(last)) => {
                TimeDelta::try_seconds(secs).is_some_and(|limit| now.signed_duration_since(last) >= limit)
            }
            _ => false,
        }
    }

    /// Recompute weights from the tracker and append an audit snapshot.
    ///
    /// The outcome counter is reset on every attempt, including skipped ones.
    pub fn trigger(&mut self, reason: &str, tracker: &PerformanceTracker, now: DateTime<Utc>) -> TriggerOutcome {
        self.state.outcomes_since_trigger = 0;

        let names: Vec<String> = tracker.model_names().map(str::to_string).collect();
        for name in &names {
            self.register_model(name);
        }

        let min_samples = self.calculator.constraints().min_sample_size;
        if !tracker.models().any(|m| m.sample_size() >= min_samples) {
            let why = format!("no model has {min_samples} samples yet");
            tracing::debug!(reason, skip = %why, "recalibration skipped");
            return TriggerOutcome::Skipped(why);
        }

        let observed: u64 = tracker.models().map(|m| m.total_predictions).sum();
        if observed == self.state.outcomes_at_last_trigger {
            let why = "no new outcomes since the previous recalibration".to_string();
            tracing::debug!(reason, skip = %why, "recalibration skipped");
            return TriggerOutcome::Skipped(why);
        }
        self.state.outcomes_at_last_trigger = observed;

        let update = self
            .calculator
            .recompute(tracker, &self.state.weights.current, &self.state.weights.base);
        let delta = update.delta();
        let performance_snapshot = tracker.recent_accuracies();

        let mut reasoning = self.reasoning(&delta, &performance_snapshot);
        if update.used_base_weights {
            reasoning.push_str(" All scores were zero; base weights restored.");
        }

        let snapshot = WeightSnapshot {
            timestamp: now,
            trigger_reason: reason.to_string(),
            old_weights: update.previous.clone(),
            new_weights: update.weights.clone(),
            delta,
            performance_snapshot,
            reasoning,
            prediction_count: tracker.total_predictions(),
            used_base_weights: update.used_base_weights,
        };

        self.state.weights.current = update.weights;
        self.state.history.push_back(snapshot.clone());
        while self.state.history.len() > self.settings.audit_log_cap {
            self.state.history.pop_front();
        }
        self.state.total_recalibrations += 1;
        self.state.last_recalibration = Some(now);

        tracing::info!(
            reason,
            models = snapshot.new_weights.len(),
            total = self.state.total_recalibrations,
            "recalibration complete"
        );
        TriggerOutcome::Recalibrated(snapshot)
    }

    fn reasoning(&self, delta: &BTreeMap<String, f64>, accuracy: &BTreeMap<String, f64>) -> String {
        let mut text = String::from("Recalibration based on recent performance.");
        let threshold = self.settings.significant_change;

        let increase = delta
            .iter()
            .filter(|(_, d)| **d > threshold)
            .max_by(|a, b| a.1.total_cmp(b.1));
        let decrease = delta
            .iter()
            .filter(|(_, d)| **d < -threshold)
            .min_by(|a, b| a.1.total_cmp(b.1));

        if let Some((model, amount)) = increase {
            let acc = accuracy.get(model).copied().unwrap_or(0.0);
            text.push_str(&format!(
                " {model} increased {:.1}% (accuracy: {:.1}%).",
                amount * 100.0,
                acc * 100.0
            ));
        }
        if let Some((model, amount)) = decrease {
            let acc = accuracy.get(model).copied().unwrap_or(0.0);
            text.push_str(&format!(
                " {model} decreased {:.1}% (accuracy: {:.1}%).",
                -amount * 100.0,
                acc * 100.0
            ));
        }
        text
    }
}
