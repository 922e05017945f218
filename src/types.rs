use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Essay,
    Code,
    Matching,
    DragDrop,
    Numerical,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultipleChoice => "multiple_choice",
            Self::TrueFalse => "true_false",
            Self::ShortAnswer => "short_answer",
            Self::Essay => "essay",
            Self::Code => "code",
            Self::Matching => "matching",
            Self::DragDrop => "drag_drop",
            Self::Numerical => "numerical",
        }
    }

    /// Types whose responses are graded outside the core (rubric scoring).
    pub fn externally_graded(&self) -> bool {
        matches!(self, Self::Essay | Self::Code)
    }
}

/// 3PL item parameters. Invariant: `discrimination > 0`, `guessing ∈ [0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrtParams {
    pub discrimination: f64,
    pub difficulty: f64,
    pub guessing: f64,
}

impl Default for IrtParams {
    fn default() -> Self {
        Self {
            discrimination: 1.0,
            difficulty: 0.0,
            guessing: 0.0,
        }
    }
}

impl IrtParams {
    pub fn new(discrimination: f64, difficulty: f64, guessing: f64) -> Self {
        Self {
            discrimination,
            difficulty,
            guessing,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.discrimination > 0.0 && (0.0..1.0).contains(&self.guessing)
    }

    /// Seed parameters from an Elo-style difficulty rating (1200-centred,
    /// 400 points per logit) for items that have never been calibrated.
    pub fn from_difficulty_rating(rating: f64) -> Self {
        Self {
            discrimination: 1.0,
            difficulty: ((rating - 1200.0) / 400.0).clamp(-3.0, 3.0),
            guessing: 0.0,
        }
    }
}

/// Scoring key carried by the item. Variants parallel `RawResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerKey {
    Choice { index: u32 },
    Boolean { value: bool },
    Text { accepted: Vec<String> },
    Numeric { value: f64, tolerance: f64 },
    Matching { pairs: Vec<(String, String)> },
    Ordering { sequence: Vec<String> },
    External { max_points: f64 },
}

/// A learner's raw answer, validated at the boundary as a tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawResponse {
    Choice { index: u32 },
    Boolean { value: bool },
    Text { value: String },
    Numeric { value: f64 },
    Matching { pairs: Vec<(String, String)> },
    Ordering { sequence: Vec<String> },
    Graded { content: String, score: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionItem {
    pub item_id: String,
    pub question_type: QuestionType,
    pub objective_tags: BTreeSet<String>,
    pub irt_params: IrtParams,
    /// Snapshot handed in by the persistence collaborator; live tallies are
    /// kept in the engine's exposure ledger.
    pub exposure_count: u64,
    /// Opaque pointer to externally-owned question content.
    pub content_ref: String,
    pub answer_key: AnswerKey,
}

impl QuestionItem {
    pub fn points_possible(&self) -> f64 {
        match &self.answer_key {
            AnswerKey::External { max_points } => *max_points,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyRange {
    pub min: f64,
    pub max: f64,
}

impl Default for DifficultyRange {
    fn default() -> Self {
        Self {
            min: -3.0,
            max: 3.0,
        }
    }
}

impl DifficultyRange {
    pub fn contains(&self, difficulty: f64) -> bool {
        difficulty >= self.min && difficulty <= self.max
    }

    pub fn width(&self) -> f64 {
        (self.max - self.min).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamConstraints {
    pub total_questions: usize,
    pub difficulty_range: DifficultyRange,
    /// Desired counts per question type; a soft preference for the
    /// generator, never a hard failure.
    #[serde(default)]
    pub question_type_distribution: BTreeMap<QuestionType, usize>,
    pub max_per_objective: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamPurpose {
    Diagnostic,
    Formative,
    Summative,
    Placement,
    Certification,
    Practice,
}

impl ExamPurpose {
    pub fn pass_fail_applies(&self) -> bool {
        matches!(self, Self::Certification | Self::Placement)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveTarget {
    pub objective_id: String,
    pub target_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRequirements {
    /// Ordered; the generator fills objectives in this order.
    pub learning_objectives: Vec<ObjectiveTarget>,
    pub constraints: ExamConstraints,
    pub purpose: ExamPurpose,
    /// Ability cut score for pass/fail purposes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_theta: Option<f64>,
}

/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveExam {
    pub exam_id: String,
    pub requirements: ExamRequirements,
    pub item_pool: Vec<QuestionItem>,
    /// Calibration version the pool parameters were taken from. Sessions
    /// keep the snapshot they started with.
    pub param_version: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    InProgress,
    Completed,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResponse {
    pub item_id: String,
    pub raw_response: RawResponse,
    pub is_correct: bool,
    pub points_earned: f64,
    pub response_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_level: Option<f64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    Eap,
    NewtonMle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    PrecisionReached,
    ItemCapReached,
    PoolExhausted,
    Abandoned,
}

/// One entry in the session's decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdaptiveAdjustment {
    Selection {
        item_id: String,
        candidates: usize,
        information: f64,
        exposure_penalized: bool,
    },
    Estimation {
        method: EstimationMethod,
        theta_before: f64,
        theta_after: f64,
        standard_error: f64,
        iterations: u32,
    },
    Stop {
        reason: StopReason,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceIndicators {
    /// 1 − coefficient of variation of response times, clamped to [0, 1].
    pub consistency_score: f64,
    pub accuracy: f64,
    pub mean_response_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSession {
    pub session_id: String,
    pub exam_id: String,
    pub learner_id: String,
    pub state: SessionState,
    /// Prior centre for ability estimation, fixed at session start.
    pub initial_ability: f64,
    pub ability_estimate: f64,
    pub standard_error: f64,
    /// Ordered, no repeats; items are appended when issued.
    pub administered_items: Vec<String>,
    /// Most recently issued item awaiting a response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_item: Option<String>,
    pub responses: Vec<ExamResponse>,
    pub adaptive_adjustments: Vec<AdaptiveAdjustment>,
    pub performance_indicators: PerformanceIndicators,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub started_at: i64,
    pub updated_at: i64,
    /// Cached on first completion so `complete_exam` is idempotent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ExamResults>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredResponse {
    pub item_id: String,
    pub is_correct: bool,
    pub points_earned: f64,
    pub ability_estimate: f64,
    pub standard_error: f64,
    pub session_state: SessionState,
    /// Adjustments recorded while handling this response.
    pub adaptive_adjustments: Vec<AdaptiveAdjustment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveMastery {
    pub objective_id: String,
    pub items_administered: usize,
    pub correct: usize,
    pub theta: f64,
    pub mastery_probability: f64,
}

/// Derived, immutable snapshot of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResults {
    pub session_id: String,
    pub exam_id: String,
    pub learner_id: String,
    pub ability_estimate: f64,
    pub standard_error: f64,
    pub objective_mastery: Vec<ObjectiveMastery>,
    pub total_points: f64,
    pub points_possible: f64,
    pub score_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    pub performance_indicators: PerformanceIndicators,
    pub items_administered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub completed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub learner_id: String,
    pub item_id: String,
    pub is_correct: bool,
    pub response_time_ms: i64,
}

/// Sparse response log consumed by the calibration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMatrix {
    pub records: Vec<ResponseRecord>,
}

impl ResponseMatrix {
    pub fn new(records: Vec<ResponseRecord>) -> Self {
        Self { records }
    }

    pub fn learner_count(&self) -> usize {
        let mut learners: Vec<&str> = self.records.iter().map(|r| r.learner_id.as_str()).collect();
        learners.sort_unstable();
        learners.dedup();
        learners.len()
    }

    pub fn responses_for_item(&self, item_id: &str) -> usize {
        self.records.iter().filter(|r| r.item_id == item_id).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IrtStdErrors {
    pub discrimination: f64,
    pub difficulty: f64,
    pub guessing: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibratedItem {
    pub item_id: String,
    pub params: IrtParams,
    pub standard_errors: IrtStdErrors,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitStatistics {
    pub log_likelihood: f64,
    /// False when the iteration cap was hit; results are still returned,
    /// flagged low-confidence.
    pub converged: bool,
    pub iterations: u32,
    /// Items below the minimum sample threshold, retaining prior parameters.
    pub skipped_items: Vec<String>,
}

/// Created on demand, never mutated after completion. The caller applies
/// the new parameters through its own versioned swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyCalibration {
    pub calibration_id: String,
    pub param_version: String,
    /// Storage reference for the input response matrix, stamped by the
    /// persistence collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix_ref: Option<String>,
    pub items: Vec<CalibratedItem>,
    pub fit_statistics: FitStatistics,
    pub sample_size: usize,
    pub created_at: i64,
}
