//! Item parameter calibration: Marginal Maximum Likelihood via EM.
//!
//! The E-step integrates each learner's ability posterior over a quadrature
//! grid under the current item parameters; the M-step updates each item's
//! `(a, b, c)` by Fisher-scoring Newton steps on the expected complete-data
//! likelihood. Runs as an offline batch over a response-log snapshot, never
//! on the live session path.

use std::collections::HashMap;

use crate::config::CalibrationConfig;
use crate::irt;
use crate::types::{
    CalibratedItem, DifficultyCalibration, FitStatistics, IrtParams, IrtStdErrors, QuestionItem,
    ResponseMatrix,
};

/// Inner Newton iterations per parameter per M-step.
const MSTEP_INNER_ITERATIONS: usize = 8;
/// Damping on Newton steps keeps early iterations from overshooting.
const MSTEP_STEP_LIMIT: f64 = 0.5;

#[derive(Debug, Clone, Default)]
pub struct CalibrationEngine {
    config: CalibrationConfig,
}

struct ItemAccumulator {
    /// Expected attempts per quadrature node.
    attempts: Vec<f64>,
    /// Expected corrects per quadrature node.
    corrects: Vec<f64>,
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Fit parameters for `items` from the pooled response log. Items below
    /// the minimum sample threshold retain their prior parameters and are
    /// listed in `fit_statistics.skipped_items`. Input items are never
    /// mutated; the caller applies the returned estimates through its own
    /// versioned swap.
    pub fn calibrate(
        &self,
        items: &[QuestionItem],
        matrix: &ResponseMatrix,
    ) -> DifficultyCalibration {
        let grid = irt::quadrature_grid(
            self.config.quadrature_points,
            self.config.theta_min,
            self.config.theta_max,
        );
        let prior: Vec<f64> = {
            let raw: Vec<f64> = grid.iter().map(|&t| irt::normal_weight(t, 0.0)).collect();
            let total: f64 = raw.iter().sum();
            raw.into_iter().map(|w| w / total).collect()
        };

        let index: HashMap<&str, usize> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.item_id.as_str(), i))
            .collect();

        // Group the sparse log by learner, dropping records for unknown items.
        let mut by_learner: HashMap<&str, Vec<(usize, bool)>> = HashMap::new();
        let mut per_item_counts = vec![0usize; items.len()];
        for record in &matrix.records {
            if let Some(&item_idx) = index.get(record.item_id.as_str()) {
                by_learner
                    .entry(record.learner_id.as_str())
                    .or_default()
                    .push((item_idx, record.is_correct));
                per_item_counts[item_idx] += 1;
            }
        }
        let sample_size = by_learner.len();

        let estimated: Vec<bool> = per_item_counts
            .iter()
            .map(|&n| n >= self.config.min_sample_size)
            .collect();
        let skipped_items: Vec<String> = items
            .iter()
            .zip(&estimated)
            .filter(|(_, est)| !**est)
            .map(|(item, _)| item.item_id.clone())
            .collect();
        if !skipped_items.is_empty() {
            tracing::info!(
                skipped = skipped_items.len(),
                threshold = self.config.min_sample_size,
                "items below minimum sample retained prior parameters"
            );
        }

        let mut params: Vec<IrtParams> = items.iter().map(|i| i.irt_params).collect();
        let mut log_likelihood = f64::NEG_INFINITY;
        let mut converged = false;
        let mut iterations = 0u32;

        // Deterministic learner order keeps runs reproducible.
        let mut learners: Vec<(&str, &Vec<(usize, bool)>)> =
            by_learner.iter().map(|(k, v)| (*k, v)).collect();
        learners.sort_by_key(|(id, _)| *id);

        for iteration in 1..=self.config.max_iterations {
            iterations = iteration;
            let (accumulators, marginal_ll) =
                self.e_step(&grid, &prior, &learners, &params, items.len());
            log_likelihood = marginal_ll;

            let mut max_change = 0.0f64;
            for (item_idx, acc) in accumulators.iter().enumerate() {
                if !estimated[item_idx] {
                    continue;
                }
                let updated = self.m_step(&grid, acc, params[item_idx]);
                let change = (updated.discrimination - params[item_idx].discrimination)
                    .abs()
                    .max((updated.difficulty - params[item_idx].difficulty).abs())
                    .max((updated.guessing - params[item_idx].guessing).abs());
                max_change = max_change.max(change);
                params[item_idx] = updated;
            }

            if max_change < self.config.convergence_tolerance {
                converged = true;
                break;
            }
        }

        if !converged {
            tracing::warn!(
                iterations,
                "calibration hit the iteration cap; results flagged low-confidence"
            );
        }

        // Final E-step under the converged parameters feeds the standard
        // errors and the reported marginal likelihood.
        let (accumulators, final_ll) =
            self.e_step(&grid, &prior, &learners, &params, items.len());
        log_likelihood = log_likelihood.max(final_ll);

        let calibrated: Vec<CalibratedItem> = items
            .iter()
            .enumerate()
            .map(|(item_idx, item)| CalibratedItem {
                item_id: item.item_id.clone(),
                params: params[item_idx],
                standard_errors: if estimated[item_idx] {
                    self.standard_errors(&grid, &accumulators[item_idx], params[item_idx])
                } else {
                    IrtStdErrors::default()
                },
                sample_size: per_item_counts[item_idx],
            })
            .collect();

        DifficultyCalibration {
            calibration_id: uuid::Uuid::new_v4().to_string(),
            param_version: chrono::Utc::now().timestamp_millis().to_string(),
            matrix_ref: None,
            items: calibrated,
            fit_statistics: FitStatistics {
                log_likelihood,
                converged,
                iterations,
                skipped_items,
            },
            sample_size,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Posterior-weighted expected counts per item per node, plus the
    /// marginal log-likelihood of the whole matrix.
    fn e_step(
        &self,
        grid: &[f64],
        prior: &[f64],
        learners: &[(&str, &Vec<(usize, bool)>)],
        params: &[IrtParams],
        item_count: usize,
    ) -> (Vec<ItemAccumulator>, f64) {
        let mut accumulators: Vec<ItemAccumulator> = (0..item_count)
            .map(|_| ItemAccumulator {
                attempts: vec![0.0; grid.len()],
                corrects: vec![0.0; grid.len()],
            })
            .collect();
        let mut marginal_ll = 0.0;

        for (_, responses) in learners {
            let log_terms: Vec<f64> = grid
                .iter()
                .zip(prior)
                .map(|(&theta, &weight)| {
                    let ll: f64 = responses
                        .iter()
                        .map(|&(item_idx, correct)| {
                            let p = irt::probability(theta, &params[item_idx])
                                .clamp(1e-10, 1.0 - 1e-10);
                            if correct {
                                p.ln()
                            } else {
                                (1.0 - p).ln()
                            }
                        })
                        .sum();
                    weight.ln() + ll
                })
                .collect();

            let max_log = log_terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let terms: Vec<f64> = log_terms.iter().map(|lt| (lt - max_log).exp()).collect();
            let total: f64 = terms.iter().sum();
            marginal_ll += max_log + total.ln();

            for (node, &term) in terms.iter().enumerate() {
                let posterior = term / total;
                for &(item_idx, correct) in *responses {
                    accumulators[item_idx].attempts[node] += posterior;
                    if correct {
                        accumulators[item_idx].corrects[node] += posterior;
                    }
                }
            }
        }

        (accumulators, marginal_ll)
    }

    /// Cyclic Fisher-scoring updates on (b, a, c) against the expected
    /// counts, each parameter clamped into its stability bounds.
    fn m_step(&self, grid: &[f64], acc: &ItemAccumulator, current: IrtParams) -> IrtParams {
        let mut params = current;

        for _ in 0..MSTEP_INNER_ITERATIONS {
            let before = params;

            let (g_b, i_b) = self.derivatives(grid, acc, &params, Parameter::Difficulty);
            if i_b > 1e-10 {
                let step = (g_b / i_b).clamp(-MSTEP_STEP_LIMIT, MSTEP_STEP_LIMIT);
                params.difficulty =
                    (params.difficulty + step).clamp(self.config.theta_min, self.config.theta_max);
            }

            let (g_a, i_a) = self.derivatives(grid, acc, &params, Parameter::Discrimination);
            if i_a > 1e-10 {
                let step = (g_a / i_a).clamp(-MSTEP_STEP_LIMIT, MSTEP_STEP_LIMIT);
                params.discrimination = (params.discrimination + step)
                    .clamp(self.config.discrimination_min, self.config.discrimination_max);
            }

            let (g_c, i_c) = self.derivatives(grid, acc, &params, Parameter::Guessing);
            if i_c > 1e-10 {
                let step = (g_c / i_c).clamp(-MSTEP_STEP_LIMIT, MSTEP_STEP_LIMIT);
                params.guessing = (params.guessing + step).clamp(0.0, self.config.guessing_max);
            }

            let delta = (params.difficulty - before.difficulty)
                .abs()
                .max((params.discrimination - before.discrimination).abs())
                .max((params.guessing - before.guessing).abs());
            if delta < self.config.convergence_tolerance {
                break;
            }
        }

        params
    }

    /// Gradient and Fisher information of the expected complete-data
    /// log-likelihood with respect to one parameter.
    fn derivatives(
        &self,
        grid: &[f64],
        acc: &ItemAccumulator,
        params: &IrtParams,
        parameter: Parameter,
    ) -> (f64, f64) {
        let mut gradient = 0.0;
        let mut information = 0.0;

        for (node, &theta) in grid.iter().enumerate() {
            let attempts = acc.attempts[node];
            if attempts <= 0.0 {
                continue;
            }
            let corrects = acc.corrects[node];
            let p = irt::probability(theta, params).clamp(1e-10, 1.0 - 1e-10);
            let q = 1.0 - p;
            let dp = partial(theta, params, parameter);

            gradient += (corrects - attempts * p) / (p * q) * dp;
            information += attempts * dp * dp / (p * q);
        }

        (gradient, information)
    }

    fn standard_errors(
        &self,
        grid: &[f64],
        acc: &ItemAccumulator,
        params: IrtParams,
    ) -> IrtStdErrors {
        let se = |parameter: Parameter| -> f64 {
            let (_, information) = self.derivatives(grid, acc, &params, parameter);
            if information > 1e-10 {
                1.0 / information.sqrt()
            } else {
                0.0
            }
        };
        IrtStdErrors {
            discrimination: se(Parameter::Discrimination),
            difficulty: se(Parameter::Difficulty),
            guessing: se(Parameter::Guessing),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Parameter {
    Discrimination,
    Difficulty,
    Guessing,
}

/// ∂p/∂(parameter) under the 3PL model.
fn partial(theta: f64, params: &IrtParams, parameter: Parameter) -> f64 {
    let z = (params.discrimination * (theta - params.difficulty)).clamp(-20.0, 20.0);
    let logistic = 1.0 / (1.0 + (-z).exp());
    let slope = logistic * (1.0 - logistic);
    match parameter {
        Parameter::Discrimination => (1.0 - params.guessing) * slope * (theta - params.difficulty),
        Parameter::Difficulty => -(1.0 - params.guessing) * slope * params.discrimination,
        Parameter::Guessing => 1.0 - logistic,
    }
}
