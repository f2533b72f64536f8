//! Ensemble Recalibration Service
//!
//! Explicitly constructed owner of the tracker, weight scheduler, calibration
//! engine, historical log and validator. Each component sits behind its own
//! `RwLock`; when two are needed the scheduler lock is taken before the
//! tracker lock. Every mutation hands a cloned snapshot to the JSON store in
//! the background.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use confidence_calibrator::{CalibrationEngine, CalibrationReport, CalibrationState};
use ensemble_core::{EnsembleError, EnsembleResult, GameOutcome, ModelResult, OutcomeRecord, PredictionModel};
use model_weighting::{
    ModelPerformanceState, PerformanceSummary, PerformanceTracker, RecalibrationScheduler, SchedulerState,
    TriggerOutcome, WeightCalculator, WeightSnapshot, WeightState,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use validation::{CrossValidator, HistoricalLog, HistoricalPrediction, ValidationSummary, ValidatorState};

use crate::blend::{blend_results, BlendedPrediction};
use crate::config::RecalibrationConfig;
use crate::persistence::{
    JsonStore, CALIBRATION_FILE, MODEL_PERFORMANCE_FILE, PREDICTION_HISTORY_FILE, RECALIBRATION_STATE_FILE,
    VALIDATION_FILE,
};

pub struct EnsembleRecalibrationService {
    config: RecalibrationConfig,
    store: Option<Arc<JsonStore>>,
    tracker: RwLock<PerformanceTracker>,
    scheduler: RwLock<RecalibrationScheduler>,
    calibration: RwLock<CalibrationEngine>,
    history: RwLock<HistoricalLog>,
    validator: RwLock<CrossValidator>,
}

fn load<T: DeserializeOwned>(store: &Option<Arc<JsonStore>>, file: &str) -> Option<T> {
    store.as_ref().and_then(|s| s.load(file))
}

impl EnsembleRecalibrationService {
    /// Build the service, resuming from the data directory when persistence
    /// is enabled. Missing or corrupt files start that component fresh.
    pub fn open(config: RecalibrationConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let now = Utc::now();

        let store = if config.persistence.enabled {
            let store = JsonStore::new(&config.persistence.data_dir);
            if let Err(e) = store.ensure_dir() {
                tracing::warn!(error = %e, "state directory unavailable, saves will be retried on each write");
            }
            Some(Arc::new(store))
        } else {
            None
        };

        let tracker = match load::<Vec<ModelPerformanceState>>(&store, MODEL_PERFORMANCE_FILE) {
            Some(states) => PerformanceTracker::from_states(config.tracker.clone(), states),
            None => PerformanceTracker::new(config.tracker.clone()),
        };

        let calculator = WeightCalculator::new(
            config.constraints.clone(),
            config.scoring.clone(),
            config.tracker.clone(),
        );
        let scheduler = match load::<SchedulerState>(&store, RECALIBRATION_STATE_FILE) {
            Some(mut state) => {
                for (model, weight) in &config.base_weights {
                    state.weights.base.entry(model.clone()).or_insert(*weight);
                }
                state.weights.default_base_weight = config.default_base_weight;
                RecalibrationScheduler::from_state(config.scheduler.clone(), calculator, state)
            }
            None => RecalibrationScheduler::new(
                config.scheduler.clone(),
                calculator,
                WeightState::new(config.base_weights.clone(), config.default_base_weight),
            ),
        };

        let calibration = match load::<CalibrationState>(&store, CALIBRATION_FILE) {
            Some(state) => CalibrationEngine::from_state(config.calibration.clone(), state),
            None => CalibrationEngine::new(config.calibration.clone()),
        };

        let v = &config.validation;
        let history = match load::<Vec<HistoricalPrediction>>(&store, PREDICTION_HISTORY_FILE) {
            Some(entries) => HistoricalLog::from_entries(v.retention_days, v.max_history_entries, entries, now),
            None => HistoricalLog::new(v.retention_days, v.max_history_entries),
        };
        let validator = match load::<ValidatorState>(&store, VALIDATION_FILE) {
            Some(state) => CrossValidator::from_state(v.clone(), state),
            None => CrossValidator::new(v.clone()),
        };

        tracing::info!(
            tracked_models = tracker.models().count(),
            weighted_models = scheduler.current_weights().len(),
            calibration_samples = calibration.total_samples(),
            historical_predictions = history.len(),
            persistence = store.is_some(),
            "ensemble recalibration service ready"
        );

        Ok(Self {
            config,
            store,
            tracker: RwLock::new(tracker),
            scheduler: RwLock::new(scheduler),
            calibration: RwLock::new(calibration),
            history: RwLock::new(history),
            validator: RwLock::new(validator),
        })
    }

    pub fn config(&self) -> &RecalibrationConfig {
        &self.config
    }

    /// Clone `value` only when there is somewhere to write it.
    fn snapshot<T>(&self, value: impl FnOnce() -> T) -> Option<T> {
        self.store.as_ref().map(|_| value())
    }

    fn persist<T: Serialize + Send + 'static>(&self, file: &'static str, value: Option<T>) {
        if let (Some(store), Some(value)) = (&self.store, value) {
            store.spawn_save(file, value);
        }
    }

    /// Feed a completed game into every component and fire a scheduled
    /// recalibration when one is due.
    pub async fn record_prediction_outcome(&self, outcome: &GameOutcome) -> EnsembleResult<()> {
        outcome.validate()?;
        let now = Utc::now();
        let pick_won = outcome.ensemble_correct();

        {
            let mut tracker = self.tracker.write().await;
            for result in &outcome.model_results {
                tracker.record_outcome(OutcomeRecord {
                    timestamp: now,
                    model_name: result.model_name.clone(),
                    predicted_probability: result.win_probability,
                    predicted_confidence: result.confidence,
                    actual_correct: result.was_correct(pick_won),
                    context_tags: outcome.context_tags.clone(),
                })?;
            }
            self.persist(MODEL_PERFORMANCE_FILE, self.snapshot(|| tracker.export_states()));
        }

        {
            let mut engine = self.calibration.write().await;
            engine.record(outcome.overall_confidence, pick_won, now);
            self.persist(CALIBRATION_FILE, self.snapshot(|| engine.state()));
        }

        {
            let mut log = self.history.write().await;
            log.add(HistoricalPrediction::from_outcome(outcome, now), now)?;
            self.persist(PREDICTION_HISTORY_FILE, self.snapshot(|| log.entries().to_vec()));
        }

        {
            let mut scheduler = self.scheduler.write().await;
            for result in &outcome.model_results {
                scheduler.register_model(result.model_name.trim());
            }
            if scheduler.note_outcome(now) {
                let tracker = self.tracker.read().await;
                if let TriggerOutcome::Recalibrated(snapshot) = scheduler.trigger("scheduled", &tracker, now) {
                    tracing::info!(
                        prediction_id = %outcome.prediction_id,
                        reasoning = %snapshot.reasoning,
                        "scheduled recalibration applied"
                    );
                }
            }
            self.persist(RECALIBRATION_STATE_FILE, self.snapshot(|| scheduler.state().clone()));
        }

        tracing::debug!(
            prediction_id = %outcome.prediction_id,
            models = outcome.model_results.len(),
            correct = pick_won,
            "recorded prediction outcome"
        );
        Ok(())
    }

    /// Log a prediction before its game is played. Recording the outcome
    /// later completes the same entry.
    pub async fn log_prediction(&self, prediction: HistoricalPrediction) -> EnsembleResult<()> {
        let mut log = self.history.write().await;
        log.add(prediction, Utc::now())?;
        self.persist(PREDICTION_HISTORY_FILE, self.snapshot(|| log.entries().to_vec()));
        Ok(())
    }

    /// Current weights, summing to 1.0. Before any recalibration these are
    /// the configured base weights brought inside the bounds.
    pub async fn get_current_weights(&self) -> BTreeMap<String, f64> {
        self.scheduler.read().await.current_weights().clone()
    }

    pub async fn calibrate_confidence(&self, raw_confidence: f64) -> f64 {
        self.calibration.read().await.calibrate(raw_confidence)
    }

    pub async fn calibration_report(&self) -> CalibrationReport {
        self.calibration.read().await.report()
    }

    pub async fn validation_summary(&self) -> ValidationSummary {
        let total = self.history.read().await.len();
        self.validator.read().await.summary(total)
    }

    /// Recompute weights now. A skipped recalibration is not an error.
    pub async fn trigger_recalibration(&self, reason: &str) -> EnsembleResult<TriggerOutcome> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EnsembleError::InvalidInput("recalibration reason is empty".to_string()));
        }

        let mut scheduler = self.scheduler.write().await;
        let tracker = self.tracker.read().await;
        let outcome = scheduler.trigger(reason, &tracker, Utc::now());
        self.persist(RECALIBRATION_STATE_FILE, self.snapshot(|| scheduler.state().clone()));
        Ok(outcome)
    }

    /// Cross-validate the completed history on a blocking worker, then adopt
    /// the validated calibration curve.
    pub async fn run_cross_validation(&self) -> EnsembleResult<ValidationSummary> {
        let data = self.history.read().await.completed();
        let settings = self.config.validation.clone();
        let now = Utc::now();

        let run = tokio::task::spawn_blocking(move || CrossValidator::evaluate(&settings, data, now))
            .await
            .map_err(|e| EnsembleError::Task(format!("cross-validation worker: {e}")))??;

        {
            let mut validator = self.validator.write().await;
            validator.apply(&run);
            self.persist(VALIDATION_FILE, self.snapshot(|| validator.state().clone()));
        }
        {
            let mut engine = self.calibration.write().await;
            engine.adopt_curve(run.curve);
            self.persist(CALIBRATION_FILE, self.snapshot(|| engine.state()));
        }

        Ok(self.validation_summary().await)
    }

    pub async fn should_revalidate(&self) -> bool {
        let completed = self.history.read().await.completed_count();
        self.validator.read().await.should_revalidate(completed, Utc::now())
    }

    pub async fn model_performance(&self, model_name: &str) -> Option<PerformanceSummary> {
        let scheduler = self.scheduler.read().await;
        let tracker = self.tracker.read().await;
        tracker
            .summary(model_name)
            .map(|s| s.with_weights(scheduler.current_weights(), scheduler.base_weights()))
    }

    pub async fn all_model_performance(&self) -> Vec<PerformanceSummary> {
        let scheduler = self.scheduler.read().await;
        let tracker = self.tracker.read().await;
        tracker
            .summaries()
            .into_iter()
            .map(|s| s.with_weights(scheduler.current_weights(), scheduler.base_weights()))
            .collect()
    }

    pub async fn recalibration_history(&self) -> Vec<WeightSnapshot> {
        self.scheduler.read().await.history().iter().cloned().collect()
    }

    /// Combine model outputs by current weight and calibrate the result.
    pub async fn blend(&self, results: &[ModelResult]) -> EnsembleResult<BlendedPrediction> {
        let mut blended = {
            let scheduler = self.scheduler.read().await;
            blend_results(scheduler.current_weights(), self.config.default_base_weight, results)?
        };
        blended.calibrated_confidence = self.calibrate_confidence(blended.raw_confidence).await;
        Ok(blended)
    }

    /// Query every model and blend what came back. Models that fail are left
    /// out; all of them failing is an error. Every model's probability must
    /// refer to the same side of the matchup.
    pub async fn predict(
        &self,
        models: &[Arc<dyn PredictionModel>],
        features: &HashMap<String, f64>,
    ) -> EnsembleResult<BlendedPrediction> {
        let mut results = Vec::with_capacity(models.len());
        for model in models {
            match model.predict(features).await {
                Ok(p) => results.push(ModelResult::new(model.name(), p.probability, p.confidence)),
                Err(e) => tracing::warn!(model = model.name(), error = %e, "model prediction failed, excluded from blend"),
            }
        }
        if results.is_empty() {
            return Err(EnsembleError::Model("no model produced a prediction".to_string()));
        }
        self.blend(&results).await
    }

    /// Write every component to disk and wait for completion.
    pub async fn save_all(&self) -> EnsembleResult<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let performance = self.tracker.read().await.export_states();
        let scheduler = self.scheduler.read().await.state().clone();
        let calibration = self.calibration.read().await.state();
        let history = self.history.read().await.entries().to_vec();
        let validator = self.validator.read().await.state().clone();
        let dir = store.dir().display().to_string();

        tokio::task::spawn_blocking(move || -> EnsembleResult<()> {
            store.save(MODEL_PERFORMANCE_FILE, &performance)?;
            store.save(RECALIBRATION_STATE_FILE, &scheduler)?;
            store.save(CALIBRATION_FILE, &calibration)?;
            store.save(PREDICTION_HISTORY_FILE, &history)?;
            store.save(VALIDATION_FILE, &validator)?;
            Ok(())
        })
        .await
        .map_err(|e| EnsembleError::Task(format!("save worker: {e}")))??;

        tracing::info!(dir = %dir, "saved ensemble state");
        Ok(())
    }
}
