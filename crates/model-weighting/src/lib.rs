//! Performance-driven ensemble weighting.
//!
//! [`PerformanceTracker`] keeps per-model outcome windows, [`WeightCalculator`]
//! turns them into bounded, rate-limited weights and [`RecalibrationScheduler`]
//! decides when to recompute and records why weights moved.

pub mod scheduler;
pub mod tracker;
pub mod weights;

pub use scheduler::{
    RecalibrationScheduler, SchedulerSettings, SchedulerState, TriggerOutcome, WeightSnapshot, WeightState,
};
pub use tracker::{
    ContextPerformance, ModelPerformanceState, PerformanceSummary, PerformanceTracker, TrackerSettings, WindowStats,
};
pub use weights::{bounded_normalize, ScoreBreakdown, ScoreSettings, WeightCalculator, WeightConstraints, WeightUpdate};
