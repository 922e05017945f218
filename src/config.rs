use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationConfig {
    /// Quadrature nodes for the EAP integral.
    pub quadrature_points: usize,
    pub theta_min: f64,
    pub theta_max: f64,
    /// Switch to Newton-Raphson MLE once the history reaches this length.
    pub mle_min_responses: usize,
    pub newton_max_iterations: u32,
    pub newton_tolerance: f64,
    /// |θ| beyond this during Newton iteration counts as divergence.
    pub theta_divergence_bound: f64,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            quadrature_points: 49,
            theta_min: -4.0,
            theta_max: 4.0,
            mle_min_responses: 5,
            newton_max_iterations: 20,
            newton_tolerance: 1e-4,
            theta_divergence_bound: 6.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoppingRules {
    pub se_threshold: f64,
    pub min_items: usize,
}

impl Default for StoppingRules {
    fn default() -> Self {
        Self {
            se_threshold: 0.3,
            min_items: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureConfig {
    /// Items whose ledger count exceeds this percentile of pool-wide counts
    /// are down-weighted, not excluded.
    pub percentile: f64,
    /// Information multiplier applied to over-exposed items.
    pub penalty: f64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            percentile: 0.9,
            penalty: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Stratification bands across the requested difficulty range.
    pub difficulty_bands: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { difficulty_bands: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub quadrature_points: usize,
    pub theta_min: f64,
    pub theta_max: f64,
    pub max_iterations: u32,
    /// EM stops when the largest parameter change falls below this.
    pub convergence_tolerance: f64,
    /// Items with fewer responses retain their prior parameters.
    pub min_sample_size: usize,
    pub discrimination_min: f64,
    pub discrimination_max: f64,
    /// Upper clamp on fitted guessing; zero pins `c` for pools with no
    /// selectable-answer items.
    pub guessing_max: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            quadrature_points: 31,
            theta_min: -4.0,
            theta_max: 4.0,
            max_iterations: 100,
            convergence_tolerance: 1e-4,
            min_sample_size: 30,
            discrimination_min: 0.2,
            discrimination_max: 2.5,
            guessing_max: 0.35,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub estimation: EstimationConfig,
    pub stopping: StoppingRules,
    pub exposure: ExposureConfig,
    pub generation: GenerationConfig,
    pub calibration: CalibrationConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("EXAM_SE_THRESHOLD") {
            if let Ok(parsed) = val.parse() {
                config.stopping.se_threshold = parsed;
            }
        }
        if let Ok(val) = std::env::var("EXAM_MIN_ITEMS") {
            if let Ok(parsed) = val.parse() {
                config.stopping.min_items = parsed;
            }
        }
        if let Ok(val) = std::env::var("EXAM_MLE_MIN_RESPONSES") {
            if let Ok(parsed) = val.parse() {
                config.estimation.mle_min_responses = parsed;
            }
        }
        if let Ok(val) = std::env::var("EXAM_CALIBRATION_MIN_SAMPLE") {
            if let Ok(parsed) = val.parse() {
                config.calibration.min_sample_size = parsed;
            }
        }
        if let Ok(val) = std::env::var("EXAM_EXPOSURE_PENALTY") {
            if let Ok(parsed) = val.parse() {
                config.exposure.penalty = parsed;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_literature_values() {
        let config = EngineConfig::default();
        assert!((config.stopping.se_threshold - 0.3).abs() < 1e-12);
        assert_eq!(config.stopping.min_items, 5);
        assert_eq!(config.estimation.mle_min_responses, 5);
        assert_eq!(config.calibration.min_sample_size, 30);
        assert!(config.estimation.quadrature_points >= 40);
    }
}
