use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{ensure, Context, Result};
use confidence_calibrator::CalibrationSettings;
use model_weighting::{SchedulerSettings, ScoreSettings, TrackerSettings, WeightConstraints};
use serde::{Deserialize, Serialize};
use validation::ValidationSettings;

/// Where and whether service state is written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub data_dir: PathBuf,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("data").join("ensemble"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalibrationConfig {
    pub tracker: TrackerSettings,
    pub constraints: WeightConstraints,
    pub scoring: ScoreSettings,
    pub scheduler: SchedulerSettings,
    pub calibration: CalibrationSettings,
    pub validation: ValidationSettings,
    pub persistence: PersistenceSettings,
    /// Starting weights; rescaled into bounds when they do not sum to 1.0
    pub base_weights: BTreeMap<String, f64>,
    /// Base weight of a model first seen at runtime
    pub default_base_weight: f64,
}

impl Default for RecalibrationConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerSettings::default(),
            constraints: WeightConstraints::default(),
            scoring: ScoreSettings::default(),
            scheduler: SchedulerSettings::default(),
            calibration: CalibrationSettings::default(),
            validation: ValidationSettings::default(),
            persistence: PersistenceSettings::default(),
            base_weights: default_base_weights(),
            default_base_weight: 0.10,
        }
    }
}

/// Hand-tuned starting weights of the production model set.
pub fn default_base_weights() -> BTreeMap<String, f64> {
    [
        ("Enhanced Statistical", 0.30),
        ("Bayesian Inference", 0.12),
        ("Monte Carlo Simulation", 0.09),
        ("Elo Rating", 0.17),
        ("Poisson Regression", 0.12),
        ("Neural Network", 0.06),
        ("Gradient Boosting", 0.07),
        ("LSTM", 0.07),
        ("Random Forest", 0.07),
    ]
    .into_iter()
    .map(|(name, weight)| (name.to_string(), weight))
    .collect()
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        _ => Ok(default),
    }
}

fn parse_optional<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Option<T>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if raw.trim().eq_ignore_ascii_case("none") => Ok(None),
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        _ => Ok(default),
    }
}

/// Parse `"Elo Rating=0.17,LSTM=0.07"`.
fn parse_weights(raw: &str) -> Result<BTreeMap<String, f64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, weight) = pair
                .split_once('=')
                .with_context(|| format!("base weight entry {pair:?} is not NAME=WEIGHT"))?;
            let weight: f64 = weight
                .trim()
                .parse()
                .with_context(|| format!("base weight for {name:?} is not a number"))?;
            Ok((name.trim().to_string(), weight))
        })
        .collect()
}

impl RecalibrationConfig {
    /// Defaults overridden by `ENSEMBLE_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let lookup = &lookup;

        let tracker = TrackerSettings {
            history_cap: parse_var(lookup, "ENSEMBLE_HISTORY_CAP", d.tracker.history_cap)?,
            recent_window: parse_var(lookup, "ENSEMBLE_RECENT_WINDOW", d.tracker.recent_window)?,
            decay_rate: parse_var(lookup, "ENSEMBLE_DECAY_RATE", d.tracker.decay_rate)?,
            context_alpha: parse_var(lookup, "ENSEMBLE_CONTEXT_ALPHA", d.tracker.context_alpha)?,
            ..d.tracker
        };

        let constraints = WeightConstraints {
            min_weight: parse_var(lookup, "ENSEMBLE_MIN_WEIGHT", d.constraints.min_weight)?,
            max_weight: parse_var(lookup, "ENSEMBLE_MAX_WEIGHT", d.constraints.max_weight)?,
            max_shift_per_update: parse_var(lookup, "ENSEMBLE_MAX_SHIFT", d.constraints.max_shift_per_update)?,
            min_sample_size: parse_var(lookup, "ENSEMBLE_MIN_SAMPLE_SIZE", d.constraints.min_sample_size)?,
            smoothing_factor: parse_var(lookup, "ENSEMBLE_WEIGHT_SMOOTHING", d.constraints.smoothing_factor)?,
        };

        let scoring = ScoreSettings {
            velocity_factor: parse_var(lookup, "ENSEMBLE_VELOCITY_FACTOR", d.scoring.velocity_factor)?,
            context_step: parse_var(lookup, "ENSEMBLE_CONTEXT_STEP", d.scoring.context_step)?,
            contextual_weighting: parse_var(lookup, "ENSEMBLE_CONTEXTUAL_WEIGHTING", d.scoring.contextual_weighting)?,
            ..d.scoring
        };

        let scheduler = SchedulerSettings {
            outcome_threshold: parse_var(lookup, "ENSEMBLE_UPDATE_FREQUENCY", d.scheduler.outcome_threshold)?,
            max_interval_secs: parse_optional(lookup, "ENSEMBLE_MAX_INTERVAL_SECS", d.scheduler.max_interval_secs)?,
            auto_recalibrate: parse_var(lookup, "ENSEMBLE_AUTO_RECALIBRATE", d.scheduler.auto_recalibrate)?,
            audit_log_cap: parse_var(lookup, "ENSEMBLE_AUDIT_LOG_CAP", d.scheduler.audit_log_cap)?,
            ..d.scheduler
        };

        let calibration = CalibrationSettings {
            bin_count: parse_var(lookup, "ENSEMBLE_CALIBRATION_BINS", d.calibration.bin_count)?,
            cold_start_samples: parse_var(lookup, "ENSEMBLE_COLD_START_SAMPLES", d.calibration.cold_start_samples)?,
            min_bin_samples: parse_var(lookup, "ENSEMBLE_MIN_BIN_SAMPLES", d.calibration.min_bin_samples)?,
            smoothing_factor: parse_var(lookup, "ENSEMBLE_CALIBRATION_SMOOTHING", d.calibration.smoothing_factor)?,
            band_floor: parse_var(lookup, "ENSEMBLE_CONFIDENCE_FLOOR", d.calibration.band_floor)?,
            band_ceiling: parse_var(lookup, "ENSEMBLE_CONFIDENCE_CEILING", d.calibration.band_ceiling)?,
            ..d.calibration
        };

        let validation = ValidationSettings {
            k_folds: parse_var(lookup, "ENSEMBLE_K_FOLDS", d.validation.k_folds)?,
            min_historical_data: parse_var(lookup, "ENSEMBLE_MIN_HISTORICAL_DATA", d.validation.min_historical_data)?,
            retention_days: parse_var(lookup, "ENSEMBLE_RETENTION_DAYS", d.validation.retention_days)?,
            temporal_validation: parse_var(lookup, "ENSEMBLE_TEMPORAL_VALIDATION", d.validation.temporal_validation)?,
            shuffle_seed: parse_optional(lookup, "ENSEMBLE_SHUFFLE_SEED", d.validation.shuffle_seed)?,
            revalidate_after_hours: parse_var(
                lookup,
                "ENSEMBLE_REVALIDATE_HOURS",
                d.validation.revalidate_after_hours,
            )?,
            ..d.validation
        };

        let persistence = PersistenceSettings {
            enabled: parse_var(lookup, "ENSEMBLE_PERSISTENCE_ENABLED", d.persistence.enabled)?,
            data_dir: lookup("ENSEMBLE_DATA_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(d.persistence.data_dir),
        };

        let base_weights = match lookup("ENSEMBLE_BASE_WEIGHTS") {
            Some(raw) if !raw.trim().is_empty() => parse_weights(&raw).context("ENSEMBLE_BASE_WEIGHTS")?,
            _ => d.base_weights,
        };

        let config = Self {
            tracker,
            constraints,
            scoring,
            scheduler,
            calibration,
            validation,
            persistence,
            base_weights,
            default_base_weight: parse_var(lookup, "ENSEMBLE_DEFAULT_BASE_WEIGHT", d.default_base_weight)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no weight or calibration state could satisfy.
    pub fn validate(&self) -> Result<()> {
        let c = &self.constraints;
        ensure!(
            (0.0..=1.0).contains(&c.min_weight) && (0.0..=1.0).contains(&c.max_weight),
            "weight bounds must lie in [0, 1]"
        );
        ensure!(
            c.min_weight <= c.max_weight,
            "min_weight {} exceeds max_weight {}",
            c.min_weight,
            c.max_weight
        );
        ensure!(c.max_shift_per_update > 0.0, "max_shift_per_update must be positive");
        ensure!(
            c.smoothing_factor > 0.0 && c.smoothing_factor <= 1.0,
            "weight smoothing_factor must be in (0, 1]"
        );

        let t = &self.tracker;
        ensure!(t.history_cap > 0, "history_cap must be positive");
        ensure!(t.recent_window > 0, "recent_window must be positive");
        ensure!(t.decay_rate > 0.0 && t.decay_rate <= 1.0, "decay_rate must be in (0, 1]");
        ensure!(t.context_alpha > 0.0 && t.context_alpha <= 1.0, "context_alpha must be in (0, 1]");

        let s = &self.scoring;
        ensure!(
            s.context_floor <= s.context_ceiling,
            "context adjustment floor exceeds its ceiling"
        );

        let cal = &self.calibration;
        ensure!(cal.bin_count > 0, "calibration needs at least one bin");
        ensure!(
            cal.lower_bound < cal.upper_bound,
            "calibration bin range [{}, {}) is empty",
            cal.lower_bound,
            cal.upper_bound
        );
        ensure!(
            (0.0..=1.0).contains(&cal.smoothing_factor),
            "calibration smoothing_factor must be in [0, 1]"
        );
        ensure!(
            0.0 <= cal.band_floor && cal.band_floor <= cal.band_ceiling && cal.band_ceiling <= 1.0,
            "confidence band [{}, {}] is inverted or outside [0, 1]",
            cal.band_floor,
            cal.band_ceiling
        );

        let v = &self.validation;
        ensure!(v.k_folds >= 2, "k_folds must be at least 2");
        ensure!(v.retention_days > 0, "retention_days must be positive");
        ensure!(
            v.confidence_level > 0.0 && v.confidence_level < 1.0,
            "confidence_level must be in (0, 1)"
        );

        ensure!(
            self.base_weights.values().all(|w| w.is_finite() && *w >= 0.0),
            "base weights must be finite and non-negative"
        );
        ensure!(
            self.default_base_weight.is_finite() && self.default_base_weight > 0.0,
            "default_base_weight must be positive"
        );

        ensure!(
            c.is_feasible_for(self.base_weights.len()),
            "{} base weights cannot sum to 1.0 inside [{}, {}]",
            self.base_weights.len(),
            c.min_weight,
            c.max_weight
        );

        if let Some(secs) = self.scheduler.max_interval_secs {
            ensure!(secs > 0, "max_interval_secs must be positive");
        }
        ensure!(v.revalidate_after_hours > 0, "revalidate_after_hours must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RecalibrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_weights.len(), 9);
        assert_eq!(config.scheduler.outcome_threshold, 10);
        assert_eq!(config.constraints.min_sample_size, 15);
    }

    #[test]
    fn test_env_overrides() {
        let config = RecalibrationConfig::from_vars(lookup(&[
            ("ENSEMBLE_MAX_WEIGHT", "0.5"),
            ("ENSEMBLE_UPDATE_FREQUENCY", "25"),
            ("ENSEMBLE_MAX_INTERVAL_SECS", "3600"),
            ("ENSEMBLE_PERSISTENCE_ENABLED", "false"),
            ("ENSEMBLE_DATA_DIR", "/tmp/ensemble-state"),
            ("ENSEMBLE_BASE_WEIGHTS", "Elo Rating=0.6, Poisson Regression=0.4"),
        ]))
        .unwrap();
        assert_eq!(config.constraints.max_weight, 0.5);
        assert_eq!(config.scheduler.outcome_threshold, 25);
        assert_eq!(config.scheduler.max_interval_secs, Some(3600));
        assert!(!config.persistence.enabled);
        assert_eq!(config.persistence.data_dir, PathBuf::from("/tmp/ensemble-state"));
        assert_eq!(config.base_weights.len(), 2);
        assert_eq!(config.base_weights["Poisson Regression"], 0.4);
    }

    #[test]
    fn test_unparsable_value_names_the_variable() {
        let err = RecalibrationConfig::from_vars(lookup(&[("ENSEMBLE_K_FOLDS", "five")])).unwrap_err();
        assert!(err.to_string().contains("ENSEMBLE_K_FOLDS"));

        let err = RecalibrationConfig::from_vars(lookup(&[("ENSEMBLE_BASE_WEIGHTS", "Elo Rating")])).unwrap_err();
        assert!(format!("{err:#}").contains("NAME=WEIGHT"));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = RecalibrationConfig::default();
        config.constraints.min_weight = 0.5;
        config.constraints.max_weight = 0.2;
        assert!(config.validate().is_err());

        let mut config = RecalibrationConfig::default();
        config.calibration.band_floor = 0.9;
        config.calibration.band_ceiling = 0.6;
        assert!(config.validate().is_err());

        let err = RecalibrationConfig::from_vars(lookup(&[("ENSEMBLE_K_FOLDS", "1")])).unwrap_err();
        assert!(err.to_string().contains("k_folds"));
    }

    #[test]
    fn test_validate_rejects_base_weights_outside_bounds() {
        // Two models can reach at most 2 * 0.40 under the default ceiling.
        let err = RecalibrationConfig::from_vars(lookup(&[(
            "ENSEMBLE_BASE_WEIGHTS",
            "Elo Rating=0.6,Poisson Regression=0.4",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("cannot sum to 1.0"));

        let mut config = RecalibrationConfig::default();
        config.constraints.min_weight = 0.2;
        assert!(config.validate().is_err());

        let mut config = RecalibrationConfig::default();
        config.base_weights.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_intervals() {
        let err = RecalibrationConfig::from_vars(lookup(&[("ENSEMBLE_MAX_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("max_interval_secs"));

        let err = RecalibrationConfig::from_vars(lookup(&[("ENSEMBLE_REVALIDATE_HOURS", "-3")])).unwrap_err();
        assert!(err.to_string().contains("revalidate_after_hours"));
    }

    #[test]
    fn test_huge_time_windows_are_accepted() {
        let config = RecalibrationConfig::from_vars(lookup(&[
            ("ENSEMBLE_RETENTION_DAYS", "1000000000000"),
            ("ENSEMBLE_MAX_INTERVAL_SECS", "9223372036854775807"),
            ("ENSEMBLE_REVALIDATE_HOURS", "9223372036854775807"),
        ]))
        .unwrap();
        assert_eq!(config.validation.retention_days, 1_000_000_000_000);
    }
}
