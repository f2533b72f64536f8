use std::collections::HashMap;

use async_trait::async_trait;

use crate::{EnsembleError, ModelPrediction};

/// Capability every individual prediction model exposes to the ensemble.
///
/// The weighting and calibration machinery only ever sees this trait; model
/// internals (tree ensembles, Poisson sampling, Elo) stay behind it.
#[async_trait]
pub trait PredictionModel: Send + Sync {
    fn name(&self) -> &str;

    async fn predict(&self, features: &HashMap<String, f64>) -> Result<ModelPrediction, EnsembleError>;
}
