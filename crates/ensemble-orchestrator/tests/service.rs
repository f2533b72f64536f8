use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use ensemble_core::{EnsembleError, GameOutcome, ModelPrediction, ModelResult, PredictionModel};
use ensemble_orchestrator::{EnsembleRecalibrationService, PersistenceSettings, RecalibrationConfig};
use model_weighting::TriggerOutcome;

fn memory_config() -> RecalibrationConfig {
    RecalibrationConfig {
        persistence: PersistenceSettings {
            enabled: false,
            ..PersistenceSettings::default()
        },
        ..RecalibrationConfig::default()
    }
}

fn disk_config(dir: &std::path::Path) -> RecalibrationConfig {
    RecalibrationConfig {
        persistence: PersistenceSettings {
            enabled: true,
            data_dir: dir.to_path_buf(),
        },
        ..RecalibrationConfig::default()
    }
}

/// Elo always backs the pick, the neural network always opposes it.
fn game(i: usize, pick_won: bool, confidence: f64) -> GameOutcome {
    GameOutcome {
        prediction_id: format!("game-{i}"),
        game_date: Utc::now() - Duration::hours(i as i64),
        home_team: "TOR".to_string(),
        away_team: "MTL".to_string(),
        model_results: vec![
            ModelResult::new("Elo Rating", 0.7, 0.7),
            ModelResult::new("Neural Network", 0.3, 0.7),
        ],
        predicted_winner: "TOR".to_string(),
        win_probability: 0.7,
        overall_confidence: confidence,
        actual_winner: if pick_won { "TOR" } else { "MTL" }.to_string(),
        context_tags: BTreeSet::new(),
    }
}

fn assert_valid_weights(weights: &std::collections::BTreeMap<String, f64>, config: &RecalibrationConfig) {
    let sum: f64 = weights.values().sum();
    assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
    for (model, w) in weights {
        assert!(
            *w >= config.constraints.min_weight - 1e-9 && *w <= config.constraints.max_weight + 1e-9,
            "{model} weight {w} out of bounds"
        );
    }
}

#[tokio::test]
async fn test_cold_start_weights_are_normalized_base() {
    let service = EnsembleRecalibrationService::open(memory_config()).unwrap();
    let weights = service.get_current_weights().await;
    assert_eq!(weights.len(), 9);
    assert_valid_weights(&weights, service.config());
    assert_abs_diff_eq!(weights["Enhanced Statistical"], 0.30 / 1.07, epsilon = 1e-6);
    assert!(service.recalibration_history().await.is_empty());
}

#[tokio::test]
async fn test_scheduled_recalibration_moves_weight_toward_accurate_model() {
    let service = EnsembleRecalibrationService::open(memory_config()).unwrap();
    let initial = service.get_current_weights().await;

    for i in 0..40 {
        service.record_prediction_outcome(&game(i, true, 0.7)).await.unwrap();
    }

    // A trigger fires every 10 outcomes; the one at 10 lacks samples and skips.
    let history = service.recalibration_history().await;
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|s| s.trigger_reason == "scheduled"));

    let weights = service.get_current_weights().await;
    assert_valid_weights(&weights, service.config());
    assert!(weights["Elo Rating"] > initial["Elo Rating"]);
    assert!(weights["Enhanced Statistical"] < initial["Enhanced Statistical"]);

    let elo = service.model_performance("Elo Rating").await.unwrap();
    assert_eq!(elo.sample_size, 40);
    assert_abs_diff_eq!(elo.overall_accuracy, 1.0);
    let nn = service.model_performance("Neural Network").await.unwrap();
    assert_abs_diff_eq!(nn.overall_accuracy, 0.0);
}

#[tokio::test]
async fn test_performance_report_carries_weights() {
    let service = EnsembleRecalibrationService::open(memory_config()).unwrap();
    for i in 0..20 {
        service.record_prediction_outcome(&game(i, true, 0.7)).await.unwrap();
    }
    let weights = service.get_current_weights().await;
    let elo = service.model_performance("Elo Rating").await.unwrap();
    assert_eq!(elo.current_weight, Some(weights["Elo Rating"]));
    assert_eq!(elo.base_weight, Some(0.17));

    let all = service.all_model_performance().await;
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|s| s.current_weight.is_some() && s.base_weight.is_some()));
}

#[tokio::test]
async fn test_unknown_models_beyond_the_weight_floor_stay_unweighted() {
    let mut config = memory_config();
    config.constraints.min_weight = 0.1;
    let service = EnsembleRecalibrationService::open(config).unwrap();

    let mut outcome = game(0, true, 0.7);
    outcome.model_results = vec![
        ModelResult::new("Brand New", 0.7, 0.7),
        ModelResult::new("Second New", 0.7, 0.7),
    ];
    service.record_prediction_outcome(&outcome).await.unwrap();

    let weights = service.get_current_weights().await;
    assert_eq!(weights.len(), 10);
    assert!(weights.contains_key("Brand New"));
    assert!(!weights.contains_key("Second New"));
    assert_valid_weights(&weights, service.config());
}

#[tokio::test]
async fn test_huge_time_windows_do_not_panic() {
    let mut config = memory_config();
    config.validation.retention_days = 1_000_000_000_000;
    config.validation.revalidate_after_hours = i64::MAX;
    config.scheduler.max_interval_secs = Some(i64::MAX);
    let service = EnsembleRecalibrationService::open(config).unwrap();

    for i in 0..60 {
        service.record_prediction_outcome(&game(i, i % 4 != 0, 0.7)).await.unwrap();
    }
    assert_eq!(service.validation_summary().await.total_predictions, 60);
    service.run_cross_validation().await.unwrap();
    assert!(!service.should_revalidate().await);
}

#[tokio::test]
async fn test_calibration_cold_start_then_bin_accuracy() {
    let service = EnsembleRecalibrationService::open(memory_config()).unwrap();
    assert_abs_diff_eq!(service.calibrate_confidence(0.9).await, 0.855, epsilon = 1e-12);
    assert_abs_diff_eq!(service.calibrate_confidence(0.3).await, 0.5, epsilon = 1e-12);

    for i in 0..30 {
        service.record_prediction_outcome(&game(i, i % 5 != 0, 0.8)).await.unwrap();
    }

    let first = service.calibrate_confidence(0.8).await;
    let second = service.calibrate_confidence(0.8).await;
    assert_eq!(first, second);
    assert_abs_diff_eq!(first, 0.8, epsilon = 1e-9);

    let report = service.calibration_report().await;
    assert!(!report.cold_start);
    assert_eq!(report.total_samples, 30);
    assert_abs_diff_eq!(report.overall_bias, 0.0, epsilon = 1e-9);
}

#[tokio::test]
async fn test_manual_trigger() {
    let service = EnsembleRecalibrationService::open(memory_config()).unwrap();
    let err = service.trigger_recalibration("  ").await.unwrap_err();
    assert!(matches!(err, EnsembleError::InvalidInput(_)));

    let outcome = service.trigger_recalibration("manual").await.unwrap();
    assert!(matches!(outcome, TriggerOutcome::Skipped(_)));

    for i in 0..15 {
        service.record_prediction_outcome(&game(i, true, 0.7)).await.unwrap();
    }
    let outcome = service.trigger_recalibration("manual").await.unwrap();
    let snapshot = outcome.snapshot().unwrap();
    assert_eq!(snapshot.trigger_reason, "manual");
    assert!(snapshot.reasoning.starts_with("Recalibration based on recent performance."));

    // Nothing new since the last trigger.
    let again = service.trigger_recalibration("manual").await.unwrap();
    assert!(matches!(again, TriggerOutcome::Skipped(_)));
}

#[tokio::test]
async fn test_cross_validation_and_curve_adoption() {
    let service = EnsembleRecalibrationService::open(memory_config()).unwrap();
    let err = service.run_cross_validation().await.unwrap_err();
    assert!(matches!(err, EnsembleError::InsufficientData { have: 0, need: 50 }));
    assert!(!service.should_revalidate().await);

    for i in 0..60 {
        service.record_prediction_outcome(&game(i, i % 4 != 0, 0.7)).await.unwrap();
    }
    assert!(service.should_revalidate().await);

    let summary = service.run_cross_validation().await.unwrap();
    assert!(summary.is_validated);
    assert_eq!(summary.completed_predictions, 60);
    assert_eq!(summary.validation_folds, 5);
    assert_abs_diff_eq!(summary.overall_accuracy, 0.75, epsilon = 1e-12);
    assert_eq!(summary.model_rankings.len(), 2);
    assert_eq!(summary.model_rankings[0].model_name, "Elo Rating");
    assert!(!service.should_revalidate().await);

    let report = service.calibration_report().await;
    assert_eq!(report.total_samples, 60);
    assert_eq!(report.bins.len(), 1);
    // 0.7 * 0.75 observed + 0.3 * 0.7 raw
    assert_abs_diff_eq!(service.calibrate_confidence(0.7).await, 0.735, epsilon = 1e-9);
}

#[tokio::test]
async fn test_blend_applies_weights_and_calibration() {
    let service = EnsembleRecalibrationService::open(memory_config()).unwrap();
    let blended = service
        .blend(&[
            ModelResult::new("Elo Rating", 0.6, 0.8),
            ModelResult::new("Enhanced Statistical", 0.7, 0.9),
        ])
        .await
        .unwrap();

    let weights = service.get_current_weights().await;
    let elo = weights["Elo Rating"];
    let stat = weights["Enhanced Statistical"];
    let expected = (elo * 0.6 + stat * 0.7) / (elo + stat);
    assert_abs_diff_eq!(blended.win_probability, expected, epsilon = 1e-12);
    assert_abs_diff_eq!(blended.weights_used.values().sum::<f64>(), 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(blended.calibrated_confidence, blended.raw_confidence * 0.95, epsilon = 1e-12);
}

struct FixedModel {
    name: &'static str,
    output: Option<ModelPrediction>,
}

#[async_trait]
impl PredictionModel for FixedModel {
    fn name(&self) -> &str {
        self.name
    }

    async fn predict(&self, _features: &HashMap<String, f64>) -> Result<ModelPrediction, EnsembleError> {
        self.output
            .ok_or_else(|| EnsembleError::Model(format!("{} is offline", self.name)))
    }
}

#[tokio::test]
async fn test_predict_skips_failing_models() {
    let service = EnsembleRecalibrationService::open(memory_config()).unwrap();
    let models: Vec<Arc<dyn PredictionModel>> = vec![
        Arc::new(FixedModel {
            name: "Poisson Regression",
            output: Some(ModelPrediction {
                probability: 0.62,
                confidence: 0.7,
            }),
        }),
        Arc::new(FixedModel {
            name: "LSTM",
            output: None,
        }),
    ];
    let blended = service.predict(&models, &HashMap::new()).await.unwrap();
    assert_eq!(blended.model_results.len(), 1);
    assert_abs_diff_eq!(blended.win_probability, 0.62, epsilon = 1e-12);

    let offline: Vec<Arc<dyn PredictionModel>> = vec![Arc::new(FixedModel {
        name: "LSTM",
        output: None,
    })];
    let err = service.predict(&offline, &HashMap::new()).await.unwrap_err();
    assert!(matches!(err, EnsembleError::Model(_)));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (weights, samples) = {
        let service = EnsembleRecalibrationService::open(disk_config(dir.path())).unwrap();
        for i in 0..20 {
            service.record_prediction_outcome(&game(i, i % 2 == 0, 0.75)).await.unwrap();
        }
        service.save_all().await.unwrap();
        (
            service.get_current_weights().await,
            service.calibration_report().await.total_samples,
        )
    };

    let reopened = EnsembleRecalibrationService::open(disk_config(dir.path())).unwrap();
    let restored = reopened.get_current_weights().await;
    assert_eq!(restored.len(), weights.len());
    for (model, w) in &weights {
        assert_abs_diff_eq!(restored[model], *w, epsilon = 1e-12);
    }
    assert_eq!(reopened.calibration_report().await.total_samples, samples);
    assert_eq!(reopened.all_model_performance().await.len(), 2);
    assert_eq!(reopened.model_performance("Elo Rating").await.unwrap().sample_size, 20);
    assert_eq!(reopened.validation_summary().await.total_predictions, 20);
    assert_eq!(reopened.recalibration_history().await.len(), 1);
}

#[tokio::test]
async fn test_corrupt_state_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("model_performance.json"), b"[{\"broken\": ").unwrap();
    std::fs::write(dir.path().join("recalibration_state.json"), b"not json at all").unwrap();

    let service = EnsembleRecalibrationService::open(disk_config(dir.path())).unwrap();
    assert!(service.all_model_performance().await.is_empty());
    let weights = service.get_current_weights().await;
    assert_eq!(weights.len(), 9);
    assert_valid_weights(&weights, service.config());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_outcomes_are_all_applied() {
    let service = Arc::new(EnsembleRecalibrationService::open(memory_config()).unwrap());
    let mut handles = Vec::new();
    for worker in 0..8 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let id = worker * 10 + i;
                service.record_prediction_outcome(&game(id, id % 3 != 0, 0.7)).await.unwrap();
                let _ = service.calibrate_confidence(0.7).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let elo = service.model_performance("Elo Rating").await.unwrap();
    assert_eq!(elo.sample_size, 80);
    assert_eq!(service.validation_summary().await.total_predictions, 80);
    assert_valid_weights(&service.get_current_weights().await, service.config());
    assert_eq!(service.calibration_report().await.total_samples, 80);
}
