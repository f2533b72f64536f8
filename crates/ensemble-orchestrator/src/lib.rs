//! Ensemble orchestration: wires performance tracking, weight recalibration,
//! confidence calibration and cross-validation into one service object.

pub mod blend;
pub mod config;
pub mod persistence;
pub mod service;

pub use blend::{blend_results, BlendedPrediction};
pub use config::{default_base_weights, PersistenceSettings, RecalibrationConfig};
pub use persistence::JsonStore;
pub use service::EnsembleRecalibrationService;
