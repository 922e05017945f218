//! Session state machine and engine façade.
//!
//! Sessions live behind a registry of per-session mutexes: response
//! submission, estimator update, and stopping-rule evaluation happen
//! atomically under one lock, while sessions for different learners run in
//! parallel. The registry itself is owned by the surrounding service; the
//! engine only exposes the TTL sweep it needs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::calibration::CalibrationEngine;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::estimation::AbilityEstimator;
use crate::generation::ExamGenerator;
use crate::results;
use crate::scoring;
use crate::selection::{ExposureLedger, ItemSelector};
use crate::types::{
    AdaptiveAdjustment, AdaptiveExam, DifficultyCalibration, ExamRequirements, ExamResponse,
    ExamResults, ExamSession, IrtParams, PerformanceIndicators, QuestionItem, RawResponse,
    ResponseMatrix, ScoredResponse, SessionState, StopReason,
};

pub struct ExamEngine {
    config: EngineConfig,
    estimator: AbilityEstimator,
    selector: ItemSelector,
    generator: ExamGenerator,
    calibrator: CalibrationEngine,
    exams: RwLock<HashMap<String, Arc<AdaptiveExam>>>,
    sessions: RwLock<HashMap<String, Arc<Mutex<ExamSession>>>>,
    exposure: ExposureLedger,
}

impl Default for ExamEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ExamEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            estimator: AbilityEstimator::new(config.estimation.clone()),
            selector: ItemSelector::new(config.exposure.clone()),
            generator: ExamGenerator::new(config.generation.clone()),
            calibrator: CalibrationEngine::new(config.calibration.clone()),
            config,
            exams: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            exposure: ExposureLedger::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Assemble an exam from the pool; the caller decides whether to
    /// install it for live sessions.
    pub fn generate_exam(
        &self,
        requirements: &ExamRequirements,
        pool: &[QuestionItem],
    ) -> Result<AdaptiveExam, EngineError> {
        self.generator.generate(requirements, pool)
    }

    pub fn generator(&self) -> &ExamGenerator {
        &self.generator
    }

    /// Register an exam for live sessions and seed its exposure counters
    /// from the persisted snapshots.
    pub fn install_exam(&self, exam: AdaptiveExam) -> String {
        let exam_id = exam.exam_id.clone();
        for item in &exam.item_pool {
            self.exposure.register(&item.item_id, item.exposure_count);
        }
        tracing::info!(exam_id = %exam_id, items = exam.item_pool.len(), "exam installed");
        self.exams.write().insert(exam_id.clone(), Arc::new(exam));
        exam_id
    }

    pub fn start_session(
        &self,
        exam_id: &str,
        learner_id: &str,
        initial_ability: Option<f64>,
    ) -> Result<ExamSession, EngineError> {
        let exam = self.exam_handle(exam_id)?;
        let theta = initial_ability.unwrap_or(0.0);
        // Prior spread before any response, so the stopping rule sees an
        // honest starting uncertainty.
        let prior = self.estimator.eap(&[], theta);
        let now = chrono::Utc::now().timestamp_millis();

        let session = ExamSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            exam_id: exam.exam_id.clone(),
            learner_id: learner_id.to_string(),
            state: SessionState::Created,
            initial_ability: theta,
            ability_estimate: prior.theta,
            standard_error: prior.standard_error,
            administered_items: Vec::new(),
            pending_item: None,
            responses: Vec::new(),
            adaptive_adjustments: Vec::new(),
            performance_indicators: PerformanceIndicators::default(),
            stop_reason: None,
            started_at: now,
            updated_at: now,
            results: None,
        };

        tracing::info!(
            session_id = %session.session_id,
            exam_id = %exam_id,
            learner_id = %learner_id,
            "session started"
        );
        self.sessions
            .write()
            .insert(session.session_id.clone(), Arc::new(Mutex::new(session.clone())));
        Ok(session)
    }

    /// Issue the next item. Repeated calls while a response is outstanding
    /// return the same pending item. A `None` from the selector completes
    /// the session and surfaces `PoolExhausted`; the caller should then
    /// call `complete_exam`.
    pub fn get_next_question(&self, session_id: &str) -> Result<QuestionItem, EngineError> {
        let handle = self.session_handle(session_id)?;
        let mut session = handle.lock();

        if session.state.is_terminal() {
            return Err(EngineError::SessionTerminated {
                state: session.state,
            });
        }
        if session.state == SessionState::Created {
            session.state = SessionState::InProgress;
        }

        let exam = self.exam_handle(&session.exam_id)?;

        if let Some(pending) = &session.pending_item {
            let item = pool_item(&exam, pending)?;
            return Ok(item.clone());
        }

        let administered: HashSet<&str> = session
            .administered_items
            .iter()
            .map(|id| id.as_str())
            .collect();
        let objective_counts = administered_objective_counts(&exam, &administered);

        let selected = self.selector.select_next(
            &exam.item_pool,
            &administered,
            &objective_counts,
            exam.requirements.constraints.max_per_objective,
            session.ability_estimate,
            &self.exposure,
        );

        let Some((item, outcome)) = selected else {
            session.state = SessionState::Completed;
            session.stop_reason = Some(StopReason::PoolExhausted);
            session.adaptive_adjustments.push(AdaptiveAdjustment::Stop {
                reason: StopReason::PoolExhausted,
            });
            session.updated_at = chrono::Utc::now().timestamp_millis();
            tracing::info!(session_id = %session_id, "pool exhausted, session completed");
            return Err(EngineError::PoolExhausted);
        };

        session.administered_items.push(item.item_id.clone());
        session.pending_item = Some(item.item_id.clone());
        session.adaptive_adjustments.push(AdaptiveAdjustment::Selection {
            item_id: outcome.item_id,
            candidates: outcome.candidates,
            information: outcome.information,
            exposure_penalized: outcome.exposure_penalized,
        });
        session.updated_at = chrono::Utc::now().timestamp_millis();
        self.exposure.record(&item.item_id);

        Ok(item.clone())
    }

    /// Score a response, update the ability estimate, and evaluate the
    /// stopping rule, all atomically under the session lock. Protocol
    /// errors leave the session unmodified.
    pub fn submit_response(
        &self,
        session_id: &str,
        item_id: &str,
        response: RawResponse,
        response_time_ms: i64,
        confidence: Option<f64>,
    ) -> Result<ScoredResponse, EngineError> {
        let handle = self.session_handle(session_id)?;
        let mut session = handle.lock();

        if session.state.is_terminal() {
            return Err(EngineError::SessionTerminated {
                state: session.state,
            });
        }
        if session.pending_item.as_deref() != Some(item_id) {
            return Err(EngineError::ItemNotAdministered {
                item_id: item_id.to_string(),
            });
        }

        let exam = self.exam_handle(&session.exam_id)?;
        let item = pool_item(&exam, item_id)?;
        let score = scoring::score_response(&item.answer_key, &response)?;

        let adjustments_start = session.adaptive_adjustments.len();
        let now = chrono::Utc::now().timestamp_millis();
        session.pending_item = None;
        session.responses.push(ExamResponse {
            item_id: item_id.to_string(),
            raw_response: response,
            is_correct: score.is_correct,
            points_earned: score.points_earned,
            response_time_ms,
            confidence_level: confidence,
            timestamp: now,
        });

        let history = response_history(&exam, &session);
        let theta_before = session.ability_estimate;
        let estimate = self.estimator.estimate(&history, session.initial_ability);
        session.ability_estimate = estimate.theta;
        session.standard_error = estimate.standard_error;
        session.adaptive_adjustments.push(AdaptiveAdjustment::Estimation {
            method: estimate.method,
            theta_before,
            theta_after: estimate.theta,
            standard_error: estimate.standard_error,
            iterations: estimate.iterations,
        });

        let times: Vec<i64> = session.responses.iter().map(|r| r.response_time_ms).collect();
        let correct = session.responses.iter().filter(|r| r.is_correct).count();
        session.performance_indicators =
            results::compute_indicators(&times, correct, session.responses.len());

        if let Some(reason) = self.stopping_reason(&session, &exam) {
            session.state = SessionState::Completed;
            session.stop_reason = Some(reason);
            session
                .adaptive_adjustments
                .push(AdaptiveAdjustment::Stop { reason });
            tracing::info!(
                session_id = %session_id,
                reason = ?reason,
                items = session.administered_items.len(),
                theta = session.ability_estimate,
                "stopping rule fired"
            );
        }
        session.updated_at = now;

        Ok(ScoredResponse {
            item_id: item_id.to_string(),
            is_correct: score.is_correct,
            points_earned: score.points_earned,
            ability_estimate: session.ability_estimate,
            standard_error: session.standard_error,
            session_state: session.state,
            adaptive_adjustments: session.adaptive_adjustments[adjustments_start..].to_vec(),
        })
    }

    /// Idempotent: the first call compiles and caches the results snapshot,
    /// later calls return the identical cached value.
    pub fn complete_exam(&self, session_id: &str) -> Result<ExamResults, EngineError> {
        let handle = self.session_handle(session_id)?;
        let mut session = handle.lock();

        if let Some(cached) = &session.results {
            return Ok(cached.clone());
        }

        if !session.state.is_terminal() {
            session.state = SessionState::Completed;
            session.pending_item = None;
        }

        let exam = self.exam_handle(&session.exam_id)?;
        let compiled = results::compile_results(&session, &exam, &self.estimator);
        session.results = Some(compiled.clone());
        session.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(compiled)
    }

    /// Explicit terminal transition; no further writes are accepted.
    pub fn abandon_session(&self, session_id: &str) -> Result<(), EngineError> {
        let handle = self.session_handle(session_id)?;
        let mut session = handle.lock();
        if session.state.is_terminal() {
            return Err(EngineError::SessionTerminated {
                state: session.state,
            });
        }
        session.state = SessionState::Abandoned;
        session.stop_reason = Some(StopReason::Abandoned);
        session.pending_item = None;
        session
            .adaptive_adjustments
            .push(AdaptiveAdjustment::Stop {
                reason: StopReason::Abandoned,
            });
        session.updated_at = chrono::Utc::now().timestamp_millis();
        tracing::info!(session_id = %session_id, "session abandoned");
        Ok(())
    }

    /// TTL sweep for the owning service: abandon live sessions idle longer
    /// than `max_idle_ms`. Returns how many were abandoned.
    pub fn abandon_idle_sessions(&self, max_idle_ms: i64) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let handles: Vec<Arc<Mutex<ExamSession>>> =
            self.sessions.read().values().cloned().collect();

        let mut abandoned = 0;
        for handle in handles {
            let mut session = handle.lock();
            if session.state.is_terminal() {
                continue;
            }
            if now - session.updated_at >= max_idle_ms {
                session.state = SessionState::Abandoned;
                session.stop_reason = Some(StopReason::Abandoned);
                session.pending_item = None;
                session
                    .adaptive_adjustments
                    .push(AdaptiveAdjustment::Stop {
                        reason: StopReason::Abandoned,
                    });
                session.updated_at = now;
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            tracing::info!(abandoned, "idle sessions abandoned");
        }
        abandoned
    }

    /// Current snapshot of a session.
    pub fn session(&self, session_id: &str) -> Result<ExamSession, EngineError> {
        let handle = self.session_handle(session_id)?;
        let session = handle.lock();
        Ok(session.clone())
    }

    pub fn exposure_count(&self, item_id: &str) -> u64 {
        self.exposure.count(item_id)
    }

    /// Offline batch calibration over a response-log snapshot; never
    /// touches live sessions.
    pub fn calibrate(
        &self,
        items: &[QuestionItem],
        matrix: &ResponseMatrix,
    ) -> DifficultyCalibration {
        self.calibrator.calibrate(items, matrix)
    }

    fn stopping_reason(&self, session: &ExamSession, exam: &AdaptiveExam) -> Option<StopReason> {
        let administered = session.administered_items.len();
        let rules = &self.config.stopping;
        if administered >= exam.requirements.constraints.total_questions {
            return Some(StopReason::ItemCapReached);
        }
        if session.standard_error <= rules.se_threshold && administered >= rules.min_items {
            return Some(StopReason::PrecisionReached);
        }
        None
    }

    fn exam_handle(&self, exam_id: &str) -> Result<Arc<AdaptiveExam>, EngineError> {
        self.exams
            .read()
            .get(exam_id)
            .cloned()
            .ok_or_else(|| EngineError::ExamNotFound(exam_id.to_string()))
    }

    fn session_handle(&self, session_id: &str) -> Result<Arc<Mutex<ExamSession>>, EngineError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }
}

fn pool_item<'a>(exam: &'a AdaptiveExam, item_id: &str) -> Result<&'a QuestionItem, EngineError> {
    exam.item_pool
        .iter()
        .find(|item| item.item_id == item_id)
        .ok_or_else(|| EngineError::ItemNotAdministered {
            item_id: item_id.to_string(),
        })
}

fn administered_objective_counts<'a>(
    exam: &'a AdaptiveExam,
    administered: &HashSet<&str>,
) -> HashMap<&'a str, usize> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in &exam.item_pool {
        if administered.contains(item.item_id.as_str()) {
            for tag in &item.objective_tags {
                *counts.entry(tag.as_str()).or_insert(0) += 1;
            }
        }
    }
    counts
}

fn response_history(exam: &AdaptiveExam, session: &ExamSession) -> Vec<(IrtParams, bool)> {
    let index: HashMap<&str, &QuestionItem> = exam
        .item_pool
        .iter()
        .map(|item| (item.item_id.as_str(), item))
        .collect();
    session
        .responses
        .iter()
        .filter_map(|response| {
            index
                .get(response.item_id.as_str())
                .map(|item| (item.irt_params, response.is_correct))
        })
        .collect()
}
