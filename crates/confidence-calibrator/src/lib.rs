//! Confidence Calibrator Module
//!
//! Bins resolved predictions by their raw confidence and maps new confidences
//! onto the accuracy those bins actually achieved.

pub mod bins;
pub mod calibrator;
pub mod report;

pub use bins::{CalibrationCurve, ConfidenceBin};
pub use calibrator::{CalibrationEngine, CalibrationSample, CalibrationSettings, CalibrationState};
pub use report::{BiasDirection, BinSummary, CalibrationReport};
