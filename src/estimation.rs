//! Ability estimation: EAP over a quadrature grid, with a Newton-Raphson
//! MLE fast path for longer histories that falls back to EAP on divergence.

use serde::{Deserialize, Serialize};

use crate::config::EstimationConfig;
use crate::irt;
use crate::types::{EstimationMethod, IrtParams};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityEstimate {
    pub theta: f64,
    pub standard_error: f64,
    pub method: EstimationMethod,
    pub iterations: u32,
}

#[derive(Debug, Clone)]
pub struct AbilityEstimator {
    config: EstimationConfig,
}

impl Default for AbilityEstimator {
    fn default() -> Self {
        Self::new(EstimationConfig::default())
    }
}

impl AbilityEstimator {
    pub fn new(config: EstimationConfig) -> Self {
        Self { config }
    }

    /// Estimate θ and its standard error from a response history.
    ///
    /// Pure function of the history; the session state machine persists the
    /// result. `prior_mean` recenters the Normal prior (spread unchanged) so
    /// placement information carries into early estimates.
    pub fn estimate(&self, history: &[(IrtParams, bool)], prior_mean: f64) -> AbilityEstimate {
        if history.len() >= self.config.mle_min_responses {
            if let Some(estimate) = self.newton_mle(history, prior_mean) {
                return estimate;
            }
            tracing::debug!(
                responses = history.len(),
                "newton mle diverged, falling back to eap"
            );
        }
        self.eap(history, prior_mean)
    }

    /// Expected-A-Posteriori estimate over the quadrature grid.
    ///
    /// Weights are computed in log space so that long all-correct or
    /// all-incorrect histories cannot underflow to a zero posterior.
    pub fn eap(&self, history: &[(IrtParams, bool)], prior_mean: f64) -> AbilityEstimate {
        let grid = irt::quadrature_grid(
            self.config.quadrature_points,
            self.config.theta_min,
            self.config.theta_max,
        );

        let log_weights: Vec<f64> = grid
            .iter()
            .map(|&theta| {
                let prior = irt::normal_weight(theta, prior_mean).ln();
                prior + irt::log_likelihood(theta, history)
            })
            .collect();

        let max_log = log_weights
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = log_weights.iter().map(|lw| (lw - max_log).exp()).collect();
        let total: f64 = weights.iter().sum();

        let mean: f64 = grid
            .iter()
            .zip(&weights)
            .map(|(theta, w)| theta * w)
            .sum::<f64>()
            / total;
        let variance: f64 = grid
            .iter()
            .zip(&weights)
            .map(|(theta, w)| (theta - mean) * (theta - mean) * w)
            .sum::<f64>()
            / total;

        AbilityEstimate {
            theta: mean,
            standard_error: variance.max(0.0).sqrt(),
            method: EstimationMethod::Eap,
            iterations: 0,
        }
    }

    /// Fisher-scoring Newton iteration on the 3PL likelihood. Returns `None`
    /// on divergence (iteration cap, |θ| beyond the bound, or vanishing
    /// information); the caller falls back to EAP.
    fn newton_mle(&self, history: &[(IrtParams, bool)], start: f64) -> Option<AbilityEstimate> {
        let mut theta = start.clamp(self.config.theta_min, self.config.theta_max);

        for iteration in 1..=self.config.newton_max_iterations {
            let info = irt::test_information(theta, history);
            if info <= 1e-10 {
                return None;
            }
            let step = irt::score(theta, history) / info;
            theta += step;

            if theta.abs() > self.config.theta_divergence_bound {
                return None;
            }
            if step.abs() < self.config.newton_tolerance {
                let final_info = irt::test_information(theta, history);
                if final_info <= 1e-10 {
                    return None;
                }
                return Some(AbilityEstimate {
                    theta,
                    standard_error: 1.0 / final_info.sqrt(),
                    method: EstimationMethod::NewtonMle,
                    iterations: iteration,
                });
            }
        }

        None
    }
}
