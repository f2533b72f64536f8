//! Weight Calculation
//!
//! Turns per-model performance into ensemble weights. The pipeline is
//! score -> normalize -> clamp to bounds -> rate limit -> smooth -> renormalize,
//! and it is fully deterministic for a given tracker state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tracker::{ModelPerformanceState, PerformanceTracker, TrackerSettings};

/// Hard limits on how weights may move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightConstraints {
    pub min_weight: f64,
    pub max_weight: f64,
    /// Largest change one recompute may apply to a single model
    pub max_shift_per_update: f64,
    /// Outcomes a model needs before its score is evidence-based
    pub min_sample_size: usize,
    /// EMA factor: smoothed = factor * target + (1 - factor) * current
    pub smoothing_factor: f64,
}

impl Default for WeightConstraints {
    fn default() -> Self {
        Self {
            min_weight: 0.05,
            max_weight: 0.40,
            max_shift_per_update: 0.03,
            min_sample_size: 15,
            smoothing_factor: 0.3,
        }
    }
}

impl WeightConstraints {
    /// Whether `model_count` weights can sum to 1.0 inside the bounds.
    pub fn is_feasible_for(&self, model_count: usize) -> bool {
        let n = model_count as f64;
        model_count > 0 && self.has_room_for(model_count) && n * self.max_weight >= 1.0 - 1e-12
    }

    /// Whether `model_count` floors still fit under a total of 1.0.
    pub fn has_room_for(&self, model_count: usize) -> bool {
        model_count as f64 * self.min_weight <= 1.0 + 1e-12
    }
}

/// Heuristic constants of the performance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSettings {
    /// Score of a model without enough evidence. 0.25 is what an honest
    /// coin-flip model (50% accuracy at 0.5 confidence) earns.
    pub neutral_score: f64,
    /// velocity_adjustment = 1 + velocity * velocity_factor
    pub velocity_factor: f64,
    /// Per-context step applied to the deviation from 0.5
    pub context_step: f64,
    pub context_bonus_above: f64,
    pub context_penalty_below: f64,
    pub context_floor: f64,
    pub context_ceiling: f64,
    /// Toggle for the contextual adjustment
    pub contextual_weighting: bool,
}

impl Default for ScoreSettings {
    fn default() -> Self {
        Self {
            neutral_score: 0.25,
            velocity_factor: 0.1,
            context_step: 0.1,
            context_bonus_above: 0.6,
            context_penalty_below: 0.4,
            context_floor: 0.5,
            context_ceiling: 1.5,
            contextual_weighting: true,
        }
    }
}

/// Breakdown of one model's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub weighted_accuracy: f64,
    pub calibration_bonus: f64,
    pub velocity_adjustment: f64,
    pub contextual_adjustment: f64,
    pub score: f64,
    pub evidence_based: bool,
}

/// Every intermediate stage of one recompute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightUpdate {
    pub previous: BTreeMap<String, f64>,
    pub scores: BTreeMap<String, ScoreBreakdown>,
    /// Scores normalized to sum to 1.0
    pub raw_targets: BTreeMap<String, f64>,
    /// After bounds, rate limiting and smoothing, before renormalization
    pub pre_normalization: BTreeMap<String, f64>,
    /// Final weights handed to callers
    pub weights: BTreeMap<String, f64>,
    /// True when no usable score existed and base weights were returned
    pub used_base_weights: bool,
}

impl WeightUpdate {
    pub fn delta(&self) -> BTreeMap<String, f64> {
        self.weights
            .iter()
            .map(|(model, w)| (model.clone(), w - self.previous.get(model).copied().unwrap_or(0.0)))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WeightCalculator {
    constraints: WeightConstraints,
    scoring: ScoreSettings,
    tracker_settings: TrackerSettings,
}

impl WeightCalculator {
    pub fn new(constraints: WeightConstraints, scoring: ScoreSettings, tracker_settings: TrackerSettings) -> Self {
        Self {
            constraints,
            scoring,
            tracker_settings,
        }
    }

    pub fn constraints(&self) -> &WeightConstraints {
        &self.constraints
    }

    /// Score one model. Below `min_sample_size` the neutral constant is used.
    pub fn score(&self, state: Option<&ModelPerformanceState>) -> ScoreBreakdown {
        let state = match state {
            Some(s) if s.sample_size() >= self.constraints.min_sample_size => s,
            _ => {
                return ScoreBreakdown {
                    weighted_accuracy: 0.0,
                    calibration_bonus: 1.0,
                    velocity_adjustment: 1.0,
                    contextual_adjustment: 1.0,
                    score: self.scoring.neutral_score,
                    evidence_based: false,
                }
            }
        };

        let weighted_accuracy = state.weighted_accuracy();
        let calibration_bonus = state.calibration_bonus();
        let velocity_adjustment = 1.0 + state.velocity(&self.tracker_settings) * self.scoring.velocity_factor;
        let contextual_adjustment = self.contextual_adjustment(state);
        let score = (weighted_accuracy * calibration_bonus * velocity_adjustment * contextual_adjustment).max(0.0);

        ScoreBreakdown {
            weighted_accuracy,
            calibration_bonus,
            velocity_adjustment,
            contextual_adjustment,
            score,
            evidence_based: true,
        }
    }

    fn contextual_adjustment(&self, state: &ModelPerformanceState) -> f64 {
        if !self.scoring.contextual_weighting {
            return 1.0;
        }
        let s = &self.scoring;
        let mut adjustment = 1.0;
        for (_, accuracy) in state.qualifying_contexts(self.tracker_settings.min_context_samples) {
            if accuracy > s.context_bonus_above {
                adjustment += s.context_step * (accuracy - 0.5);
            } else if accuracy < s.context_penalty_below {
                adjustment -= s.context_step * (0.5 - accuracy);
            }
        }
        adjustment.clamp(s.context_floor, s.context_ceiling)
    }

    /// Recompute weights for every model in `current`. Tracked models
    /// without a current weight are left out.
    pub fn recompute(
        &self,
        tracker: &PerformanceTracker,
        current: &BTreeMap<String, f64>,
        base: &BTreeMap<String, f64>,
    ) -> WeightUpdate {
        let c = &self.constraints;

        let scores: BTreeMap<String, ScoreBreakdown> = current
            .keys()
            .map(|model| (model.clone(), self.score(tracker.get(model))))
            .collect();

        let total_score: f64 = scores.values().map(|s| s.score).sum();
        if total_score <= 0.0 || !total_score.is_finite() {
            let fallback: BTreeMap<String, f64> = current
                .keys()
                .map(|m| (m.clone(), base.get(m).copied().unwrap_or(0.0)))
                .collect();
            let weights = bounded_normalize(&fallback, c.min_weight, c.max_weight);
            tracing::warn!("all model scores are zero, falling back to base weights");
            return WeightUpdate {
                previous: current.clone(),
                scores,
                raw_targets: fallback.clone(),
                pre_normalization: fallback,
                weights,
                used_base_weights: true,
            };
        }

        let raw_targets: BTreeMap<String, f64> = scores
            .iter()
            .map(|(m, s)| (m.clone(), s.score / total_score))
            .collect();

        let pre_normalization: BTreeMap<String, f64> = raw_targets
            .iter()
            .map(|(model, target)| {
                let now = current.get(model).copied().unwrap_or(0.0);
                let bounded = target.clamp(c.min_weight, c.max_weight);
                let limited = bounded.clamp(now - c.max_shift_per_update, now + c.max_shift_per_update);
                let smoothed = c.smoothing_factor * limited + (1.0 - c.smoothing_factor) * now;
                (model.clone(), smoothed)
            })
            .collect();

        let weights = bounded_normalize(&pre_normalization, c.min_weight, c.max_weight);

        for (model, new_weight) in &weights {
            let old = current.get(model).copied().unwrap_or(0.0);
            if (new_weight - old).abs() > 0.01 {
                tracing::info!(model = %model, old, new = *new_weight, "model weight moved");
            }
        }

        WeightUpdate {
            previous: current.clone(),
            scores,
            raw_targets,
            pre_normalization,
            weights,
            used_base_weights: false,
        }
    }
}

/// Scale `weights` to sum to 1.0 while keeping each inside `[min, max]`.
///
/// Solves `sum(clamp(lambda * w_i, min, max)) = 1` for `lambda` by bisection.
/// When the bounds cannot hold `weights.len()` entries summing to 1.0 the
/// bounds are dropped and a plain proportional normalization is returned.
pub fn bounded_normalize(weights: &BTreeMap<String, f64>, min: f64, max: f64) -> BTreeMap<String, f64> {
    if weights.is_empty() {
        return BTreeMap::new();
    }
    let n = weights.len() as f64;
    let sanitized: BTreeMap<String, f64> = weights
        .iter()
        .map(|(m, w)| (m.clone(), if w.is_finite() && *w > 0.0 { *w } else { 0.0 }))
        .collect();
    let total: f64 = sanitized.values().sum();

    let proportional = |values: &BTreeMap<String, f64>| -> BTreeMap<String, f64> {
        if total > 0.0 {
            values.iter().map(|(m, w)| (m.clone(), w / total)).collect()
        } else {
            values.keys().map(|m| (m.clone(), 1.0 / n)).collect()
        }
    };

    let feasible = n * min <= 1.0 + 1e-12 && n * max >= 1.0 - 1e-12;
    if !feasible {
        tracing::warn!(models = weights.len(), min, max, "weight bounds infeasible, normalizing without them");
        return proportional(&sanitized);
    }

    // With no signal at all every model gets an equal share, which is in bounds.
    if total <= 0.0 {
        return proportional(&sanitized);
    }
    if (total - 1.0).abs() <= 1e-12 && sanitized.values().all(|w| *w >= min && *w <= max) {
        return sanitized;
    }

    let clamped_sum = |lambda: f64| -> f64 { sanitized.values().map(|w| (lambda * w).clamp(min, max)).sum() };

    let mut hi = 1.0 / total;
    let mut guard = 0;
    while clamped_sum(hi) < 1.0 && guard < 200 {
        hi *= 2.0;
        guard += 1;
    }
    if clamped_sum(hi) < 1.0 - 1e-12 {
        // Zero-weight entries stuck at `min` cap the reachable sum below 1.0.
        return proportional(&sanitized);
    }
    let mut lo = 0.0;
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if clamped_sum(mid) < 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let mut result: BTreeMap<String, f64> = sanitized
        .iter()
        .map(|(m, w)| (m.clone(), (hi * w).clamp(min, max)))
        .collect();

    // Push the remaining rounding residue onto entries with room to absorb it.
    let residue = 1.0 - result.values().sum::<f64>();
    if residue.abs() > 0.0 {
        if let Some(slot) = result
            .values_mut()
            .find(|w| **w + residue >= min && **w + residue <= max)
        {
            *slot += residue;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::Utc;
    use ensemble_core::OutcomeRecord;
    use std::collections::BTreeSet;

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(m, w)| (m.to_string(), *w)).collect()
    }

    fn feed(tracker: &mut PerformanceTracker, model: &str, n: usize, accuracy: f64, confidence: f64) {
        for i in 0..n {
            let correct = (i as f64 + 0.5) / n as f64 <= accuracy;
            tracker
                .record_outcome(OutcomeRecord {
                    timestamp: Utc::now(),
                    model_name: model.to_string(),
                    predicted_probability: confidence,
                    predicted_confidence: confidence,
                    actual_correct: correct,
                    context_tags: BTreeSet::new(),
                })
                .unwrap();
        }
    }

    #[test]
    fn test_bounded_normalize_sums_to_one_within_bounds() {
        let input = weights(&[("a", 10.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]);
        let out = bounded_normalize(&input, 0.05, 0.40);
        assert_abs_diff_eq!(out.values().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(out["a"], 0.40, epsilon = 1e-9);
        for w in out.values() {
            assert!(*w >= 0.05 - 1e-12 && *w <= 0.40 + 1e-12);
        }
        assert_abs_diff_eq!(out["b"], 0.20, epsilon = 1e-9);
    }

    #[test]
    fn test_bounded_normalize_infeasible_falls_back() {
        let input = weights(&[("a", 3.0), ("b", 1.0)]);
        let out = bounded_normalize(&input, 0.05, 0.40);
        assert_abs_diff_eq!(out["a"], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(out["b"], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_below_min_sample_size_scores_neutral() {
        let mut tracker = PerformanceTracker::default();
        feed(&mut tracker, "Elo Rating", 5, 1.0, 0.9);
        let calc = WeightCalculator::default();
        let s = calc.score(tracker.get("Elo Rating"));
        assert!(!s.evidence_based);
        assert_eq!(s.score, ScoreSettings::default().neutral_score);
        assert!(!calc.score(None).evidence_based);
    }

    #[test]
    fn test_score_combines_factors() {
        let mut tracker = PerformanceTracker::default();
        feed(&mut tracker, "Elo Rating", 20, 1.0, 0.9);
        let calc = WeightCalculator::default();
        let s = calc.score(tracker.get("Elo Rating"));
        assert!(s.evidence_based);
        assert_abs_diff_eq!(s.weighted_accuracy, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.calibration_bonus, 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(s.velocity_adjustment, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.score, 0.9, epsilon = 1e-12);
    }

    #[test]
    fn test_recompute_respects_shift_and_bounds() {
        let mut tracker = PerformanceTracker::default();
        feed(&mut tracker, "Elo Rating", 30, 0.9, 0.8);
        feed(&mut tracker, "Poisson Regression", 30, 0.3, 0.8);
        feed(&mut tracker, "Random Forest", 30, 0.6, 0.6);
        let current = weights(&[("Elo Rating", 0.3), ("Poisson Regression", 0.4), ("Random Forest", 0.3)]);
        let calc = WeightCalculator::default();
        let update = calc.recompute(&tracker, &current, &current);

        assert!(!update.used_base_weights);
        let c = calc.constraints();
        for (model, w) in &update.pre_normalization {
            assert!((w - current[model]).abs() <= c.max_shift_per_update + 1e-12);
        }
        assert_abs_diff_eq!(update.weights.values().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(update.weights["Elo Rating"] > current["Elo Rating"]);
        assert!(update.weights["Poisson Regression"] < current["Poisson Regression"]);
    }

    #[test]
    fn test_recompute_is_deterministic() {
        let mut tracker = PerformanceTracker::default();
        feed(&mut tracker, "Elo Rating", 25, 0.7, 0.7);
        feed(&mut tracker, "Neural Network", 25, 0.55, 0.8);
        let current = weights(&[("Elo Rating", 0.5), ("Neural Network", 0.5)]);
        let calc = WeightCalculator::new(
            WeightConstraints {
                max_weight: 0.9,
                ..WeightConstraints::default()
            },
            ScoreSettings::default(),
            TrackerSettings::default(),
        );
        let a = calc.recompute(&tracker, &current, &current);
        let b = calc.recompute(&tracker, &current, &current);
        assert_eq!(a.weights, b.weights);
    }

    #[test]
    fn test_zero_scores_fall_back_to_base() {
        let mut tracker = PerformanceTracker::default();
        feed(&mut tracker, "Elo Rating", 20, 0.0, 0.9);
        feed(&mut tracker, "LSTM", 20, 0.0, 0.9);
        let current = weights(&[("Elo Rating", 0.5), ("LSTM", 0.5)]);
        let base = weights(&[("Elo Rating", 0.6), ("LSTM", 0.4)]);
        let calc = WeightCalculator::new(
            WeightConstraints {
                max_weight: 0.9,
                ..WeightConstraints::default()
            },
            ScoreSettings::default(),
            TrackerSettings::default(),
        );
        let update = calc.recompute(&tracker, &current, &base);
        assert!(update.used_base_weights);
        assert_abs_diff_eq!(update.weights["Elo Rating"], 0.6, epsilon = 1e-9);
        assert_abs_diff_eq!(update.weights["LSTM"], 0.4, epsilon = 1e-9);
    }

    #[test]
    fn test_contextual_adjustment_is_clamped() {
        let mut tracker = PerformanceTracker::default();
        let tags: BTreeSet<String> = (0..40).map(|i| format!("ctx_{i}")).collect();
        for _ in 0..20 {
            tracker
                .record_outcome(OutcomeRecord {
                    timestamp: Utc::now(),
                    model_name: "Elo Rating".to_string(),
                    predicted_probability: 0.8,
                    predicted_confidence: 0.8,
                    actual_correct: true,
                    context_tags: tags.clone(),
                })
                .unwrap();
        }
        let calc = WeightCalculator::default();
        let s = calc.score(tracker.get("Elo Rating"));
        assert_abs_diff_eq!(s.contextual_adjustment, 1.5, epsilon = 1e-12);
    }
}
