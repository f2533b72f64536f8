//! Cross-validation of ensemble predictions against recorded outcomes.

pub mod cross_validation;
pub mod history;
pub mod metrics;
pub mod summary;

pub use cross_validation::{
    fold_ranges, CrossValidator, ModelValidationResult, ValidationResult, ValidationRun, ValidationSettings,
    ValidatorState,
};
pub use history::{HistoricalLog, HistoricalPrediction};
pub use metrics::{ClassMetrics, ConfidenceInterval, OutcomeScores};
pub use summary::ValidationSummary;
