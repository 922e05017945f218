//! Score-report compilation for finished sessions.

use std::collections::{BTreeMap, HashMap};

use crate::estimation::AbilityEstimator;
use crate::irt;
use crate::types::{
    AdaptiveExam, ExamResults, ExamSession, IrtParams, ObjectiveMastery, PerformanceIndicators,
};

/// Compile the immutable results snapshot for a session. Pure derivation;
/// callers cache the output for idempotent completion.
pub fn compile_results(
    session: &ExamSession,
    exam: &AdaptiveExam,
    estimator: &AbilityEstimator,
) -> ExamResults {
    let item_index: HashMap<&str, &crate::types::QuestionItem> = exam
        .item_pool
        .iter()
        .map(|item| (item.item_id.as_str(), item))
        .collect();

    let total_points: f64 = session.responses.iter().map(|r| r.points_earned).sum();
    let points_possible: f64 = session
        .responses
        .iter()
        .filter_map(|r| item_index.get(r.item_id.as_str()))
        .map(|item| item.points_possible())
        .sum();
    let score_ratio = if points_possible > 0.0 {
        total_points / points_possible
    } else {
        0.0
    };

    let objective_mastery = compile_objective_mastery(session, exam, estimator, &item_index);

    let passed = exam
        .requirements
        .pass_theta
        .filter(|_| exam.requirements.purpose.pass_fail_applies())
        .map(|cut| session.ability_estimate - session.standard_error >= cut);

    ExamResults {
        session_id: session.session_id.clone(),
        exam_id: session.exam_id.clone(),
        learner_id: session.learner_id.clone(),
        ability_estimate: session.ability_estimate,
        standard_error: session.standard_error,
        objective_mastery,
        total_points,
        points_possible,
        score_ratio,
        passed,
        performance_indicators: session.performance_indicators.clone(),
        items_administered: session.administered_items.len(),
        stop_reason: session.stop_reason,
        completed_at: chrono::Utc::now().timestamp_millis(),
    }
}

/// Per-objective ability and mastery probability. Objectives with at least
/// two responses get their own subset EAP; thinner objectives fall back to
/// the session-level θ. Mastery is the 3PL success probability against the
/// objective's median-difficulty item.
fn compile_objective_mastery(
    session: &ExamSession,
    exam: &AdaptiveExam,
    estimator: &AbilityEstimator,
    item_index: &HashMap<&str, &crate::types::QuestionItem>,
) -> Vec<ObjectiveMastery> {
    let mut per_objective: BTreeMap<&str, Vec<(IrtParams, bool)>> = BTreeMap::new();
    for objective in &exam.requirements.learning_objectives {
        per_objective.entry(objective.objective_id.as_str()).or_default();
    }
    for response in &session.responses {
        let Some(item) = item_index.get(response.item_id.as_str()) else {
            continue;
        };
        for tag in &item.objective_tags {
            per_objective
                .entry(tag.as_str())
                .or_default()
                .push((item.irt_params, response.is_correct));
        }
    }

    per_objective
        .into_iter()
        .map(|(objective_id, history)| {
            let theta = if history.len() >= 2 {
                estimator.eap(&history, session.ability_estimate).theta
            } else {
                session.ability_estimate
            };
            let reference = median_difficulty_params(exam, objective_id);
            let mastery_probability = irt::probability(theta, &reference);
            let correct = history.iter().filter(|(_, c)| *c).count();
            ObjectiveMastery {
                objective_id: objective_id.to_string(),
                items_administered: history.len(),
                correct,
                theta,
                mastery_probability,
            }
        })
        .collect()
}

fn median_difficulty_params(exam: &AdaptiveExam, objective_id: &str) -> IrtParams {
    let mut tagged: Vec<&IrtParams> = exam
        .item_pool
        .iter()
        .filter(|item| item.objective_tags.contains(objective_id))
        .map(|item| &item.irt_params)
        .collect();
    if tagged.is_empty() {
        return IrtParams::default();
    }
    tagged.sort_by(|a, b| a.difficulty.total_cmp(&b.difficulty));
    *tagged[tagged.len() / 2]
}

/// Running performance indicators, recomputed after each response.
pub fn compute_indicators(
    response_times_ms: &[i64],
    correct_count: usize,
    total: usize,
) -> PerformanceIndicators {
    if total == 0 || response_times_ms.is_empty() {
        return PerformanceIndicators::default();
    }
    let n = response_times_ms.len() as f64;
    let mean = response_times_ms.iter().map(|&t| t as f64).sum::<f64>() / n;
    let variance = response_times_ms
        .iter()
        .map(|&t| {
            let d = t as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let cv = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };

    PerformanceIndicators {
        consistency_score: (1.0 - cv).clamp(0.0, 1.0),
        accuracy: correct_count as f64 / total as f64,
        mean_response_time_ms: mean,
    }
}
