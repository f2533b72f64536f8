//! Shared types for the ensemble weighting and calibration workspace.

pub mod error;
pub mod stats;
pub mod traits;
pub mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
