//! Three-parameter logistic (3PL) primitives shared by the estimator,
//! selector, and calibration engine.

use crate::types::IrtParams;

/// Logistic argument clamp; beyond ±20 the curve is numerically saturated.
const MAX_LOGIT: f64 = 20.0;

/// `P(correct | θ) = c + (1 - c) / (1 + exp(-a(θ - b)))`.
pub fn probability(theta: f64, params: &IrtParams) -> f64 {
    let z = (params.discrimination * (theta - params.difficulty)).clamp(-MAX_LOGIT, MAX_LOGIT);
    let logistic = 1.0 / (1.0 + (-z).exp());
    params.guessing + (1.0 - params.guessing) * logistic
}

/// Fisher information of one item at θ.
///
/// `I(θ) = a² · (q/p) · ((p - c) / (1 - c))²`, the standard 3PL form.
pub fn information(theta: f64, params: &IrtParams) -> f64 {
    let p = probability(theta, params);
    let q = 1.0 - p;
    if p <= 0.0 || q <= 0.0 {
        return 0.0;
    }
    let a = params.discrimination;
    let c = params.guessing;
    let scaled = (p - c) / (1.0 - c);
    a * a * (q / p) * scaled * scaled
}

/// Log-likelihood of a response history at θ.
pub fn log_likelihood(theta: f64, history: &[(IrtParams, bool)]) -> f64 {
    history
        .iter()
        .map(|(params, correct)| {
            let p = probability(theta, params).clamp(1e-10, 1.0 - 1e-10);
            if *correct {
                p.ln()
            } else {
                (1.0 - p).ln()
            }
        })
        .sum()
}

/// Score function (d log-likelihood / dθ) for Newton-Raphson updates.
pub fn score(theta: f64, history: &[(IrtParams, bool)]) -> f64 {
    history
        .iter()
        .map(|(params, correct)| {
            let p = probability(theta, params).clamp(1e-10, 1.0 - 1e-10);
            let q = 1.0 - p;
            let a = params.discrimination;
            let c = params.guessing;
            let z = (a * (theta - params.difficulty)).clamp(-MAX_LOGIT, MAX_LOGIT);
            let logistic = 1.0 / (1.0 + (-z).exp());
            let dp = (1.0 - c) * logistic * (1.0 - logistic) * a;
            let u = if *correct { 1.0 } else { 0.0 };
            (u - p) / (p * q) * dp
        })
        .sum()
}

/// Total test information at θ.
pub fn test_information(theta: f64, history: &[(IrtParams, bool)]) -> f64 {
    history
        .iter()
        .map(|(params, _)| information(theta, params))
        .sum()
}

/// Evenly spaced quadrature nodes over [min, max].
pub fn quadrature_grid(points: usize, min: f64, max: f64) -> Vec<f64> {
    let n = points.max(2);
    let step = (max - min) / (n - 1) as f64;
    (0..n).map(|i| min + step * i as f64).collect()
}

/// Unnormalized standard-normal density; normalization cancels in the
/// EAP and E-step weight ratios.
pub fn normal_weight(theta: f64, mean: f64) -> f64 {
    let d = theta - mean;
    (-0.5 * d * d).exp()
}
