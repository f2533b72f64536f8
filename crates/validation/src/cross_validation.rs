//! K-fold cross-validation over the historical prediction log.
//!
//! No model is fitted here: every fold is scored as a held-out test set and the
//! remaining folds only contribute their size. Ordering is temporal by default
//! so that each run emulates out-of-time testing.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, TimeDelta, Utc};
use confidence_calibrator::CalibrationCurve;
use ensemble_core::stats::{mean, ratio, sanitize_unit};
use ensemble_core::{EnsembleError, EnsembleResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::history::HistoricalPrediction;
use crate::metrics::{p_value_vs_coin_flip, ClassMetrics, ConfidenceInterval, OutcomeScores};
use crate::summary::ValidationSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    pub k_folds: usize,
    /// Upper bound on k regardless of configuration
    pub max_folds: usize,
    pub min_historical_data: usize,
    pub retention_days: i64,
    pub max_history_entries: usize,
    /// Sort by game date (true) or shuffle (false)
    pub temporal_validation: bool,
    /// Seed for the shuffle; None draws from OS entropy
    pub shuffle_seed: Option<u64>,
    pub confidence_level: f64,
    pub calibration_bins: usize,
    pub revalidate_after_hours: i64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            k_folds: 5,
            max_folds: 20,
            min_historical_data: 50,
            retention_days: 365,
            max_history_entries: 5_000,
            temporal_validation: true,
            shuffle_seed: None,
            confidence_level: 0.95,
            calibration_bins: 10,
            revalidate_after_hours: 24,
        }
    }
}

/// One model's scores on a test fold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelValidationResult {
    pub model_name: String,
    pub samples: usize,
    pub accuracy: f64,
    pub calibration_error: f64,
    pub brier_score: f64,
    pub average_confidence: f64,
    /// Share of the summed accuracy across ranked models
    #[serde(default)]
    pub optimal_weight: f64,
    /// 1 = best; only set on rankings
    #[serde(default)]
    pub performance_rank: usize,
}

/// Scores of one held-out fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub fold_index: usize,
    pub train_size: usize,
    pub test_size: usize,
    pub accuracy: f64,
    pub home: ClassMetrics,
    pub away: ClassMetrics,
    pub brier_score: f64,
    pub log_loss: f64,
    pub mean_calibration_error: f64,
    pub confidence_interval: ConfidenceInterval,
    pub p_value: f64,
    pub model_performance: BTreeMap<String, ModelValidationResult>,
    pub validated_at: DateTime<Utc>,
}

/// Output of one complete cross-validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRun {
    pub folds: Vec<ValidationResult>,
    /// Curve over raw confidence, built from every completed prediction
    pub curve: CalibrationCurve,
    pub completed_predictions: usize,
    pub total_correct: usize,
    pub validated_at: DateTime<Utc>,
}

/// Persisted validator state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorState {
    pub results: Vec<ValidationResult>,
    pub curve: Option<CalibrationCurve>,
    pub completed_predictions: usize,
    pub total_correct: usize,
    pub last_validated: Option<DateTime<Utc>>,
}

/// Contiguous `[start, end)` test ranges; the last fold absorbs the remainder.
pub fn fold_ranges(len: usize, k: usize) -> Vec<Range<usize>> {
    if len == 0 || k == 0 {
        return Vec::new();
    }
    let k = k.min(len);
    let fold_size = len / k;
    (0..k)
        .map(|i| {
            let start = i * fold_size;
            let end = if i == k - 1 { len } else { start + fold_size };
            start..end
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct CrossValidator {
    settings: ValidationSettings,
    state: ValidatorState,
}

impl CrossValidator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self {
            settings,
            state: ValidatorState::default(),
        }
    }

    pub fn from_state(settings: ValidationSettings, state: ValidatorState) -> Self {
        Self { settings, state }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    pub fn state(&self) -> &ValidatorState {
        &self.state
    }

    pub fn is_validated(&self) -> bool {
        self.state.last_validated.is_some() && !self.state.results.is_empty()
    }

    /// Effective fold count for `n` items: configured k clamped to `[2, min(n, max_folds)]`.
    pub fn effective_folds(settings: &ValidationSettings, n: usize) -> usize {
        let upper = n.min(settings.max_folds.max(2));
        settings.k_folds.clamp(2, upper.max(2))
    }

    /// Run the full validation over a point-in-time copy of the log.
    ///
    /// Holds no locks and touches no shared state, so callers can run it on a
    /// blocking worker.
    pub fn evaluate(
        settings: &ValidationSettings,
        mut data: Vec<HistoricalPrediction>,
        now: DateTime<Utc>,
    ) -> EnsembleResult<ValidationRun> {
        data.retain(|p| p.is_completed());
        let need = settings.min_historical_data.max(2);
        if data.len() < need {
            return Err(EnsembleError::InsufficientData {
                have: data.len(),
                need,
            });
        }

        if settings.temporal_validation {
            data.sort_by(|a, b| {
                a.game_date
                    .cmp(&b.game_date)
                    .then_with(|| a.prediction_id.cmp(&b.prediction_id))
            });
        } else {
            let mut rng = match settings.shuffle_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            data.shuffle(&mut rng);
        }

        let k = Self::effective_folds(settings, data.len());
        tracing::info!(folds = k, predictions = data.len(), "starting cross-validation");

        let ranges = fold_ranges(data.len(), k);
        let folds: Vec<ValidationResult> = ranges
            .iter()
            .enumerate()
            .map(|(index, range)| {
                let test = &data[range.clone()];
                Self::evaluate_fold(settings, index, test, data.len() - test.len(), now)
            })
            .collect();

        let samples: Vec<(f64, bool)> = data
            .iter()
            .filter_map(|p| p.is_correct().map(|c| (sanitize_unit(p.raw_confidence), c)))
            .collect();
        let curve = CalibrationCurve::rebuild(&samples, 0.0, 1.0, settings.calibration_bins, now);
        let total_correct = samples.iter().filter(|(_, c)| *c).count();

        tracing::info!(
            accuracy = ratio(total_correct as f64, data.len() as f64, 0.0),
            folds = folds.len(),
            "cross-validation complete"
        );

        Ok(ValidationRun {
            folds,
            curve,
            completed_predictions: data.len(),
            total_correct,
            validated_at: now,
        })
    }

    fn evaluate_fold(
        settings: &ValidationSettings,
        fold_index: usize,
        test: &[HistoricalPrediction],
        train_size: usize,
        now: DateTime<Utc>,
    ) -> ValidationResult {
        let scores = OutcomeScores::score(test);
        tracing::debug!(
            fold = fold_index,
            test_size = test.len(),
            accuracy = scores.accuracy,
            "validated fold"
        );
        ValidationResult {
            fold_index,
            train_size,
            test_size: test.len(),
            accuracy: scores.accuracy,
            home: scores.home,
            away: scores.away,
            brier_score: scores.brier_score,
            log_loss: scores.log_loss,
            mean_calibration_error: scores.mean_calibration_error,
            confidence_interval: ConfidenceInterval::binomial(
                scores.accuracy,
                scores.samples,
                settings.confidence_level,
            ),
            p_value: p_value_vs_coin_flip(scores.accuracy, scores.samples),
            model_performance: model_scores(test),
            validated_at: now,
        }
    }

    /// Store a finished run as the current validation state.
    pub fn apply(&mut self, run: &ValidationRun) {
        self.state = ValidatorState {
            results: run.folds.clone(),
            curve: Some(run.curve.clone()),
            completed_predictions: run.completed_predictions,
            total_correct: run.total_correct,
            last_validated: Some(run.validated_at),
        };
    }

    /// Evaluate and apply in one step.
    pub fn run(&mut self, data: Vec<HistoricalPrediction>, now: DateTime<Utc>) -> EnsembleResult<ValidationRun> {
        let run = Self::evaluate(&self.settings, data, now)?;
        self.apply(&run);
        Ok(run)
    }

    /// True if never validated and enough data exists, or if the last
    /// validation is older than the revalidation interval.
    pub fn should_revalidate(&self, completed_predictions: usize, now: DateTime<Utc>) -> bool {
        match self.state.last_validated {
            None => completed_predictions >= self.settings.min_historical_data,
            Some(last) => TimeDelta::try_hours(self.settings.revalidate_after_hours)
                .is_some_and(|interval| now.signed_duration_since(last) > interval),
        }
    }

    /// Pooled accuracy over every tested prediction.
    pub fn overall_accuracy(&self) -> f64 {
        ratio(
            self.state.total_correct as f64,
            self.state.completed_predictions as f64,
            0.0,
        )
    }

    pub fn overall_confidence_interval(&self) -> ConfidenceInterval {
        ConfidenceInterval::binomial(
            self.overall_accuracy(),
            self.state.completed_predictions,
            self.settings.confidence_level,
        )
    }

    /// Models ranked by fold-averaged accuracy, ties broken by lower calibration error.
    pub fn model_rankings(&self) -> Vec<ModelValidationResult> {
        let mut per_model: BTreeMap<String, Vec<&ModelValidationResult>> = BTreeMap::new();
        for fold in &self.state.results {
            for (name, result) in &fold.model_performance {
                per_model.entry(name.clone()).or_default().push(result);
            }
        }

        let mut rankings: Vec<ModelValidationResult> = per_model
            .into_iter()
            .map(|(name, folds)| {
                let avg = |f: fn(&ModelValidationResult) -> f64| mean(&folds.iter().map(|r| f(r)).collect::<Vec<_>>());
                ModelValidationResult {
                    model_name: name,
                    samples: folds.iter().map(|r| r.samples).sum(),
                    accuracy: avg(|r| r.accuracy),
                    calibration_error: avg(|r| r.calibration_error),
                    brier_score: avg(|r| r.brier_score),
                    average_confidence: avg(|r| r.average_confidence),
                    optimal_weight: 0.0,
                    performance_rank: 0,
                }
            })
            .collect();

        rankings.sort_by(|a, b| {
            b.accuracy
                .total_cmp(&a.accuracy)
                .then_with(|| a.calibration_error.total_cmp(&b.calibration_error))
                .then_with(|| a.model_name.cmp(&b.model_name))
        });

        let accuracy_total: f64 = rankings.iter().map(|r| r.accuracy).sum();
        let count = rankings.len();
        for (i, r) in rankings.iter_mut().enumerate() {
            r.performance_rank = i + 1;
            r.optimal_weight = ratio(r.accuracy, accuracy_total, 1.0 / count as f64);
        }
        rankings
    }

    pub fn summary(&self, total_predictions: usize) -> ValidationSummary {
        ValidationSummary::build(self, total_predictions)
    }
}

/// Per-model scores within one fold. A model is correct when it backed the
/// side that won.
fn model_scores(test: &[HistoricalPrediction]) -> BTreeMap<String, ModelValidationResult> {
    struct Acc {
        samples: usize,
        correct: usize,
        error: f64,
        brier: f64,
        confidence: f64,
    }

    let mut acc: BTreeMap<String, Acc> = BTreeMap::new();
    for prediction in test {
        let Some(pick_won) = prediction.is_correct() else {
            continue;
        };
        let outcome = if pick_won { 1.0 } else { 0.0 };
        for model in &prediction.model_results {
            let p = sanitize_unit(model.win_probability);
            let entry = acc.entry(model.model_name.clone()).or_insert(Acc {
                samples: 0,
                correct: 0,
                error: 0.0,
                brier: 0.0,
                confidence: 0.0,
            });
            entry.samples += 1;
            entry.correct += usize::from(model.was_correct(pick_won));
            entry.error += (p - outcome).abs();
            entry.brier += (p - outcome).powi(2);
            entry.confidence += sanitize_unit(model.confidence);
        }
    }

    acc.into_iter()
        .map(|(name, a)| {
            let n = a.samples as f64;
            let result = ModelValidationResult {
                model_name: name.clone(),
                samples: a.samples,
                accuracy: ratio(a.correct as f64, n, 0.0),
                calibration_error: ratio(a.error, n, 0.0),
                brier_score: ratio(a.brier, n, 0.0),
                average_confidence: ratio(a.confidence, n, 0.0),
                optimal_weight: 0.0,
                performance_rank: 0,
            };
            (name, result)
        })
        .collect()
}
