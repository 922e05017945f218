//! Answer-key scoring. Every `(AnswerKey, RawResponse)` pairing is handled
//! exhaustively; a shape mismatch is a protocol error and leaves the
//! session untouched.

use crate::error::EngineError;
use crate::types::{AnswerKey, RawResponse};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOutcome {
    pub is_correct: bool,
    pub points_earned: f64,
    pub points_possible: f64,
}

pub fn score_response(
    key: &AnswerKey,
    response: &RawResponse,
) -> Result<ScoreOutcome, EngineError> {
    match (key, response) {
        (AnswerKey::Choice { index }, RawResponse::Choice { index: given }) => {
            Ok(binary(index == given))
        }
        (AnswerKey::Boolean { value }, RawResponse::Boolean { value: given }) => {
            Ok(binary(value == given))
        }
        (AnswerKey::Text { accepted }, RawResponse::Text { value }) => {
            let normalized = normalize(value);
            Ok(binary(accepted.iter().any(|a| normalize(a) == normalized)))
        }
        (AnswerKey::Numeric { value, tolerance }, RawResponse::Numeric { value: given }) => {
            Ok(binary((given - value).abs() <= *tolerance))
        }
        (AnswerKey::Matching { pairs }, RawResponse::Matching { pairs: given }) => {
            let matched = pairs.iter().filter(|p| given.contains(p)).count();
            Ok(fraction(matched, pairs.len()))
        }
        (AnswerKey::Ordering { sequence }, RawResponse::Ordering { sequence: given }) => {
            if given.len() != sequence.len() {
                return Ok(ScoreOutcome {
                    is_correct: false,
                    points_earned: 0.0,
                    points_possible: 1.0,
                });
            }
            let matched = sequence
                .iter()
                .zip(given)
                .filter(|(expected, got)| expected == got)
                .count();
            Ok(fraction(matched, sequence.len()))
        }
        (AnswerKey::External { max_points }, RawResponse::Graded { score, .. }) => {
            let earned = score.clamp(0.0, *max_points);
            Ok(ScoreOutcome {
                is_correct: earned >= 0.5 * max_points,
                points_earned: earned,
                points_possible: *max_points,
            })
        }
        _ => Err(EngineError::ResponseTypeMismatch),
    }
}

fn binary(correct: bool) -> ScoreOutcome {
    ScoreOutcome {
        is_correct: correct,
        points_earned: if correct { 1.0 } else { 0.0 },
        points_possible: 1.0,
    }
}

fn fraction(matched: usize, total: usize) -> ScoreOutcome {
    if total == 0 {
        return binary(true);
    }
    let ratio = matched as f64 / total as f64;
    ScoreOutcome {
        is_correct: matched == total,
        points_earned: ratio,
        points_possible: 1.0,
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}
