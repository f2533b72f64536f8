//! Numeric helpers shared by the tracker, calibrator and validator.
//!
//! Every ratio in the workspace goes through [`ratio`] so that an empty sample
//! yields a defined neutral value instead of NaN.

/// Lower bound applied to probabilities before taking a logarithm.
pub const PROBABILITY_FLOOR: f64 = 0.001;
/// Upper bound applied to probabilities before taking a logarithm.
pub const PROBABILITY_CEIL: f64 = 0.999;

/// `numerator / denominator`, or `fallback` when the denominator is zero or not finite.
pub fn ratio(numerator: f64, denominator: f64, fallback: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        return fallback;
    }
    numerator / denominator
}

/// Compute the mean of a data slice.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Fraction of `true` values; 0.0 for an empty slice.
pub fn hit_rate<I>(outcomes: I) -> f64
where
    I: IntoIterator<Item = bool>,
{
    let (hits, total) = outcomes
        .into_iter()
        .fold((0usize, 0usize), |(h, t), o| (h + usize::from(o), t + 1));
    ratio(hits as f64, total as f64, 0.0)
}

/// Clamp into `[0.001, 0.999]` so `ln` stays finite.
pub fn clamp_probability(p: f64) -> f64 {
    sanitize_unit(p).clamp(PROBABILITY_FLOOR, PROBABILITY_CEIL)
}

/// Map non-finite input to 0.5 and clamp into `[0, 1]`.
pub fn sanitize_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.5
    }
}

/// Harmonic mean of precision and recall; 0.0 when both are zero.
pub fn f1_score(precision: f64, recall: f64) -> f64 {
    ratio(2.0 * precision * recall, precision + recall, 0.0)
}

/// Negative log-likelihood of one binary outcome under probability `p`.
pub fn log_loss(p: f64, correct: bool) -> f64 {
    let p = clamp_probability(p);
    if correct {
        -p.ln()
    } else {
        -(1.0 - p).ln()
    }
}

/// Squared error between `p` and the binary outcome.
pub fn brier(p: f64, correct: bool) -> f64 {
    let y = if correct { 1.0 } else { 0.0 };
    (p - y).powi(2)
}
