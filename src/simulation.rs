//! Synthetic response generation from known item parameters. Feeds the
//! calibration round-trip tests and lets hosts rehearse pool designs
//! before going live. Nothing on the live session path draws randomness.

use rand::Rng;

use crate::irt;
use crate::types::{QuestionItem, ResponseMatrix, ResponseRecord};

/// Bernoulli draw from the 3PL model.
pub fn simulate_response<R: Rng>(rng: &mut R, theta: f64, item: &QuestionItem) -> bool {
    rng.random::<f64>() < irt::probability(theta, &item.irt_params)
}

/// Full response matrix for a cohort of simulated learners, each answering
/// every item once. Response times are drawn uniformly from a plausible
/// window; the calibration engine ignores them.
pub fn simulate_matrix<R: Rng>(
    rng: &mut R,
    items: &[QuestionItem],
    abilities: &[(String, f64)],
) -> ResponseMatrix {
    let mut records = Vec::with_capacity(items.len() * abilities.len());
    for (learner_id, theta) in abilities {
        for item in items {
            records.push(ResponseRecord {
                learner_id: learner_id.clone(),
                item_id: item.item_id.clone(),
                is_correct: simulate_response(rng, *theta, item),
                response_time_ms: 1500 + (rng.random::<f64>() * 6000.0) as i64,
            });
        }
    }
    ResponseMatrix::new(records)
}

/// Cohort abilities drawn from the standard-normal population the
/// calibration prior assumes. Box-Muller, so only `rand`'s uniform source
/// is needed.
pub fn normal_cohort<R: Rng>(rng: &mut R, learners: usize) -> Vec<(String, f64)> {
    (0..learners)
        .map(|i| {
            let u1: f64 = rng.random::<f64>().max(1e-10);
            let u2: f64 = rng.random();
            let theta = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            (format!("sim_{i:04}"), theta)
        })
        .collect()
}

/// Evenly spaced cohort abilities over [min, max], handy for calibration
/// rehearsals that need coverage of the whole θ range.
pub fn ability_ladder(learners: usize, min: f64, max: f64) -> Vec<(String, f64)> {
    let n = learners.max(1);
    (0..n)
        .map(|i| {
            let theta = if n == 1 {
                (min + max) / 2.0
            } else {
                min + (max - min) * i as f64 / (n - 1) as f64
            };
            (format!("sim_{i:04}"), theta)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnswerKey, IrtParams, QuestionType};
    use std::collections::BTreeSet;

    fn item(id: &str, difficulty: f64) -> QuestionItem {
        QuestionItem {
            item_id: id.to_string(),
            question_type: QuestionType::TrueFalse,
            objective_tags: BTreeSet::new(),
            irt_params: IrtParams::new(1.0, difficulty, 0.0),
            exposure_count: 0,
            content_ref: format!("content/{id}"),
            answer_key: AnswerKey::Boolean { value: true },
        }
    }

    #[test]
    fn test_ability_ladder_spans_range() {
        let ladder = ability_ladder(5, -2.0, 2.0);
        assert_eq!(ladder.len(), 5);
        assert!((ladder[0].1 + 2.0).abs() < 1e-12);
        assert!((ladder[4].1 - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_high_ability_answers_easy_items_mostly_correctly() {
        let mut rng = rand::rng();
        let easy = item("easy", -3.0);
        let correct = (0..500)
            .filter(|_| simulate_response(&mut rng, 3.0, &easy))
            .count();
        // P(correct) here is essentially 1.
        assert!(correct > 450);
    }

    #[test]
    fn test_normal_cohort_centres_on_zero() {
        let mut rng = rand::rng();
        let cohort = normal_cohort(&mut rng, 2000);
        assert_eq!(cohort.len(), 2000);
        let mean = cohort.iter().map(|(_, t)| t).sum::<f64>() / 2000.0;
        assert!(mean.abs() < 0.15, "cohort mean {mean} drifted");
        assert!(cohort.iter().all(|(_, t)| t.is_finite()));
    }

    #[test]
    fn test_matrix_dimensions() {
        let mut rng = rand::rng();
        let items = vec![item("q1", 0.0), item("q2", 1.0)];
        let abilities = ability_ladder(10, -2.0, 2.0);
        let matrix = simulate_matrix(&mut rng, &items, &abilities);
        assert_eq!(matrix.records.len(), 20);
        assert_eq!(matrix.learner_count(), 10);
        assert_eq!(matrix.responses_for_item("q1"), 10);
    }
}
