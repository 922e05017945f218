//! Calibration round-trip: simulate responses from known parameters, fit
//! from neutral starting values, and check the recovered parameters.
//!
//! Cohorts are drawn from the standard-normal population the MML prior
//! assumes; a mismatched ability distribution would shrink the recovered
//! scale and say nothing about the fitting code.

use std::collections::BTreeSet;

use exam_engine::calibration::CalibrationEngine;
use exam_engine::config::CalibrationConfig;
use exam_engine::simulation::{ability_ladder, normal_cohort, simulate_matrix};
use exam_engine::types::{AnswerKey, IrtParams, QuestionItem, QuestionType};

fn item_with_params(id: &str, params: IrtParams) -> QuestionItem {
    QuestionItem {
        item_id: id.to_string(),
        question_type: QuestionType::MultipleChoice,
        objective_tags: BTreeSet::new(),
        irt_params: params,
        exposure_count: 0,
        content_ref: format!("content/{id}"),
        answer_key: AnswerKey::Choice { index: 0 },
    }
}

fn neutral_start(items: &[QuestionItem]) -> Vec<QuestionItem> {
    items
        .iter()
        .map(|item| {
            let mut reset = item.clone();
            reset.irt_params = IrtParams::default();
            reset
        })
        .collect()
}

#[test]
fn difficulty_recovered_within_tolerance() {
    // Free-response battery, so the guessing floor is pinned at zero and
    // the fit is effectively 2PL. Difficulties sit inside the well-covered
    // part of the ability range.
    let truth = vec![
        item_with_params("q0", IrtParams::new(1.2, -1.0, 0.0)),
        item_with_params("q1", IrtParams::new(1.0, -0.6, 0.0)),
        item_with_params("q2", IrtParams::new(0.9, -0.2, 0.0)),
        item_with_params("q3", IrtParams::new(1.1, 0.2, 0.0)),
        item_with_params("q4", IrtParams::new(1.0, 0.6, 0.0)),
        item_with_params("q5", IrtParams::new(0.8, 1.0, 0.0)),
    ];
    let mut rng = rand::rng();
    let cohort = normal_cohort(&mut rng, 1200);
    let matrix = simulate_matrix(&mut rng, &truth, &cohort);

    let engine = CalibrationEngine::new(CalibrationConfig {
        guessing_max: 0.0,
        max_iterations: 200,
        ..Default::default()
    });
    let calibration = engine.calibrate(&neutral_start(&truth), &matrix);

    assert!(calibration.fit_statistics.skipped_items.is_empty());
    assert_eq!(calibration.sample_size, 1200);
    for (fitted, expected) in calibration.items.iter().zip(&truth) {
        assert!(
            (fitted.params.difficulty - expected.irt_params.difficulty).abs() < 0.35,
            "{}: fitted b {} too far from true {}",
            fitted.item_id,
            fitted.params.difficulty,
            expected.irt_params.difficulty
        );
        assert!(fitted.params.is_valid());
        assert!((fitted.params.guessing - 0.0).abs() < 1e-12);
        assert!(fitted.standard_errors.difficulty > 0.0);
        assert!(
            fitted.standard_errors.difficulty < 0.3,
            "difficulty SE should be tight at this sample size"
        );
    }

    // Relative ordering always survives recovery.
    let fitted_b: Vec<f64> = calibration
        .items
        .iter()
        .map(|i| i.params.difficulty)
        .collect();
    for pair in fitted_b.windows(2) {
        assert!(pair[0] < pair[1], "fitted difficulties out of order: {fitted_b:?}");
    }
}

#[test]
fn guessing_floor_recovered_for_guessable_items() {
    // Sharp anchors pin each learner's posterior; low-ability learners then
    // clear the c = 0.25 item far more often than a zero-floor model
    // predicts, so the fit must move c well off zero while staying inside
    // the stability bound.
    let mut truth: Vec<QuestionItem> = (0..8)
        .map(|i| {
            let difficulty = -2.0 + i as f64 * (4.0 / 7.0);
            item_with_params(&format!("anchor_{i}"), IrtParams::new(1.5, difficulty, 0.0))
        })
        .collect();
    truth.push(item_with_params("q_mc", IrtParams::new(1.2, 1.0, 0.25)));

    let mut rng = rand::rng();
    let cohort = normal_cohort(&mut rng, 1200);
    let matrix = simulate_matrix(&mut rng, &truth, &cohort);

    let engine = CalibrationEngine::new(CalibrationConfig::default());
    let calibration = engine.calibrate(&neutral_start(&truth), &matrix);
    let fitted = calibration
        .items
        .iter()
        .find(|i| i.item_id == "q_mc")
        .unwrap();
    assert!(
        fitted.params.guessing > 0.05,
        "fitted c {} stayed at zero",
        fitted.params.guessing
    );
    assert!(fitted.params.guessing <= 0.35);
}

#[test]
fn iteration_cap_is_a_soft_failure() {
    let truth = vec![
        item_with_params("q1", IrtParams::new(1.0, -0.5, 0.0)),
        item_with_params("q2", IrtParams::new(1.0, 0.5, 0.0)),
    ];
    let mut rng = rand::rng();
    let matrix = simulate_matrix(&mut rng, &truth, &ability_ladder(100, -2.0, 2.0));

    // A single EM iteration cannot converge; results still come back,
    // flagged low-confidence.
    let engine = CalibrationEngine::new(CalibrationConfig {
        max_iterations: 1,
        ..Default::default()
    });
    let calibration = engine.calibrate(&neutral_start(&truth), &matrix);
    assert!(!calibration.fit_statistics.converged);
    assert_eq!(calibration.fit_statistics.iterations, 1);
    assert_eq!(calibration.items.len(), 2);
    assert!(calibration.fit_statistics.log_likelihood.is_finite());
}

#[test]
fn thin_items_are_skipped_and_reported() {
    let well_sampled = item_with_params("q_rich", IrtParams::new(1.0, 0.0, 0.0));
    let thin = item_with_params("q_thin", IrtParams::new(1.3, 0.7, 0.1));

    let mut rng = rand::rng();
    let mut matrix = simulate_matrix(
        &mut rng,
        std::slice::from_ref(&well_sampled),
        &ability_ladder(200, -2.5, 2.5),
    );
    // Only a handful of responses for the thin item.
    let thin_matrix = simulate_matrix(
        &mut rng,
        std::slice::from_ref(&thin),
        &ability_ladder(5, -1.0, 1.0),
    );
    matrix.records.extend(thin_matrix.records);

    let engine = CalibrationEngine::new(CalibrationConfig::default());
    let items = vec![well_sampled, thin.clone()];
    let calibration = engine.calibrate(&items, &matrix);

    assert_eq!(calibration.fit_statistics.skipped_items, vec!["q_thin"]);
    let fitted_thin = calibration
        .items
        .iter()
        .find(|i| i.item_id == "q_thin")
        .unwrap();
    // Prior parameters retained untouched.
    assert_eq!(fitted_thin.params, thin.irt_params);
    assert_eq!(fitted_thin.sample_size, 5);
}
