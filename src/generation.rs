//! Exam assembly: greedy constrained selection with stratified difficulty
//! bands, objective by objective in requirement order.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::GenerationConfig;
use crate::error::EngineError;
use crate::types::{
    AdaptiveExam, DifficultyRange, ExamRequirements, QuestionItem, QuestionType,
};

/// Cooperative cancellation flag shared with the caller. Cancelling simply
/// discards partial results; nothing is persisted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Progress callbacks for long-running generation over large pools.
pub trait GenerationProgress: Send + Sync {
    fn on_objective_start(&self, objective_id: &str, target: usize);
    fn on_objective_filled(&self, objective_id: &str, selected: usize);
    fn on_complete(&self, total_items: usize);
}

/// No-op progress reporter.
pub struct NoopProgress;

impl GenerationProgress for NoopProgress {
    fn on_objective_start(&self, _: &str, _: usize) {}
    fn on_objective_filled(&self, _: &str, _: usize) {}
    fn on_complete(&self, _: usize) {}
}

#[derive(Debug, Clone, Default)]
pub struct ExamGenerator {
    config: GenerationConfig,
}

impl ExamGenerator {
    pub fn new(config: GenerationConfig) -> Self {
        Self { config }
    }

    /// Assemble an adaptive exam pool: at least `total_questions` items, the
    /// live session picks its subset at runtime.
    pub fn generate(
        &self,
        requirements: &ExamRequirements,
        pool: &[QuestionItem],
    ) -> Result<AdaptiveExam, EngineError> {
        match self.generate_with_progress(requirements, pool, &NoopProgress, &CancelFlag::new())? {
            Some(exam) => Ok(exam),
            None => unreachable!("generation with a fresh cancel flag cannot be cancelled"),
        }
    }

    /// Fixed-form variant: the assembled pool is exactly
    /// `total_questions` items.
    pub fn generate_fixed_form(
        &self,
        requirements: &ExamRequirements,
        pool: &[QuestionItem],
    ) -> Result<AdaptiveExam, EngineError> {
        let mut exam = self.generate(requirements, pool)?;
        exam.item_pool
            .truncate(exam.requirements.constraints.total_questions);
        Ok(exam)
    }

    /// Cancellable, progress-reporting variant. `Ok(None)` means the caller
    /// cancelled; partial selections are discarded.
    pub fn generate_with_progress(
        &self,
        requirements: &ExamRequirements,
        pool: &[QuestionItem],
        progress: &dyn GenerationProgress,
        cancel: &CancelFlag,
    ) -> Result<Option<AdaptiveExam>, EngineError> {
        let constraints = &requirements.constraints;
        let mut selected: Vec<QuestionItem> = Vec::new();
        let mut selected_ids: HashSet<&str> = HashSet::new();
        let mut type_counts: BTreeMap<QuestionType, usize> = BTreeMap::new();

        for objective in &requirements.learning_objectives {
            if cancel.is_cancelled() {
                tracing::info!(objective = %objective.objective_id, "exam generation cancelled");
                return Ok(None);
            }

            let target = objective.target_count.min(constraints.max_per_objective);
            progress.on_objective_start(&objective.objective_id, target);

            let candidates: Vec<&QuestionItem> = pool
                .iter()
                .filter(|item| !selected_ids.contains(item.item_id.as_str()))
                .filter(|item| item.objective_tags.contains(&objective.objective_id))
                .filter(|item| {
                    constraints
                        .difficulty_range
                        .contains(item.irt_params.difficulty)
                })
                .collect();

            if candidates.len() < target {
                return Err(EngineError::InsufficientPoolCoverage {
                    objective: objective.objective_id.clone(),
                    required: target,
                    available: candidates.len(),
                });
            }

            let picked = self.stratified_pick(
                &candidates,
                target,
                &constraints.difficulty_range,
                &constraints.question_type_distribution,
                &type_counts,
            );
            for item in picked {
                *type_counts.entry(item.question_type).or_insert(0) += 1;
                selected_ids.insert(item.item_id.as_str());
                selected.push(item.clone());
            }

            progress.on_objective_filled(&objective.objective_id, target);
        }

        // Top up from leftover in-range items so the adaptive session has at
        // least `total_questions` to choose from.
        if selected.len() < constraints.total_questions {
            let mut leftovers: Vec<&QuestionItem> = pool
                .iter()
                .filter(|item| !selected_ids.contains(item.item_id.as_str()))
                .filter(|item| {
                    constraints
                        .difficulty_range
                        .contains(item.irt_params.difficulty)
                })
                .collect();
            leftovers.sort_by(|a, b| a.item_id.cmp(&b.item_id));
            for item in leftovers {
                if selected.len() >= constraints.total_questions {
                    break;
                }
                *type_counts.entry(item.question_type).or_insert(0) += 1;
                selected_ids.insert(item.item_id.as_str());
                selected.push(item.clone());
            }
        }

        if selected.len() < constraints.total_questions {
            return Err(EngineError::InsufficientPoolSize {
                required: constraints.total_questions,
                available: selected.len(),
            });
        }

        progress.on_complete(selected.len());
        tracing::debug!(
            items = selected.len(),
            objectives = requirements.learning_objectives.len(),
            "exam pool assembled"
        );

        Ok(Some(AdaptiveExam {
            exam_id: uuid::Uuid::new_v4().to_string(),
            requirements: requirements.clone(),
            item_pool: selected,
            param_version: "uncalibrated".to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }))
    }

    /// Round-robin across difficulty bands so the picked subset covers the
    /// requested range; within a band, prefer question types still owed by
    /// the distribution, then higher discrimination, then item id.
    fn stratified_pick<'a>(
        &self,
        candidates: &[&'a QuestionItem],
        target: usize,
        range: &DifficultyRange,
        wanted_types: &BTreeMap<QuestionType, usize>,
        type_counts: &BTreeMap<QuestionType, usize>,
    ) -> Vec<&'a QuestionItem> {
        let bands = self.config.difficulty_bands.clamp(1, 5);
        let width = range.width().max(f64::EPSILON);

        let mut by_band: Vec<Vec<&'a QuestionItem>> = vec![Vec::new(); bands];
        for &item in candidates {
            let offset = (item.irt_params.difficulty - range.min) / width;
            let band = ((offset * bands as f64) as usize).min(bands - 1);
            by_band[band].push(item);
        }

        let type_owed = |item: &QuestionItem| -> bool {
            let wanted = wanted_types.get(&item.question_type).copied().unwrap_or(0);
            let have = type_counts.get(&item.question_type).copied().unwrap_or(0);
            wanted > have
        };
        for band in &mut by_band {
            band.sort_by(|a, b| {
                type_owed(*b)
                    .cmp(&type_owed(*a))
                    .then(
                        b.irt_params
                            .discrimination
                            .total_cmp(&a.irt_params.discrimination),
                    )
                    .then(a.item_id.cmp(&b.item_id))
            });
        }

        let mut picked = Vec::with_capacity(target);
        let mut cursors = vec![0usize; bands];
        while picked.len() < target {
            let mut advanced = false;
            for band in 0..bands {
                if picked.len() >= target {
                    break;
                }
                if cursors[band] < by_band[band].len() {
                    picked.push(by_band[band][cursors[band]]);
                    cursors[band] += 1;
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
        }
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AnswerKey, ExamConstraints, ExamPurpose, IrtParams, ObjectiveTarget, QuestionItem,
    };
    use std::collections::BTreeSet;

    fn item(id: &str, difficulty: f64, tags: &[&str]) -> QuestionItem {
        QuestionItem {
            item_id: id.to_string(),
            question_type: QuestionType::MultipleChoice,
            objective_tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            irt_params: IrtParams::new(1.0, difficulty, 0.0),
            exposure_count: 0,
            content_ref: format!("content/{id}"),
            answer_key: AnswerKey::Choice { index: 0 },
        }
    }

    fn requirements(objectives: &[(&str, usize)], total: usize) -> ExamRequirements {
        ExamRequirements {
            learning_objectives: objectives
                .iter()
                .map(|(id, count)| ObjectiveTarget {
                    objective_id: id.to_string(),
                    target_count: *count,
                })
                .collect(),
            constraints: ExamConstraints {
                total_questions: total,
                difficulty_range: DifficultyRange {
                    min: -2.0,
                    max: 2.0,
                },
                question_type_distribution: BTreeMap::new(),
                max_per_objective: 10,
            },
            purpose: ExamPurpose::Formative,
            pass_theta: None,
        }
    }

    fn spread_pool(tag: &str, count: usize) -> Vec<QuestionItem> {
        (0..count)
            .map(|i| {
                let difficulty = -1.8 + 3.6 * (i as f64 / (count - 1).max(1) as f64);
                item(&format!("{tag}_q{i:02}"), difficulty, &[tag])
            })
            .collect()
    }

    #[test]
    fn test_generate_covers_objectives_in_order() {
        let mut pool = spread_pool("obj1", 8);
        pool.extend(spread_pool("obj2", 8));
        let generator = ExamGenerator::default();
        let exam = generator
            .generate(&requirements(&[("obj1", 4), ("obj2", 4)], 8), &pool)
            .unwrap();
        assert!(exam.item_pool.len() >= 8);
        let obj1 = exam
            .item_pool
            .iter()
            .filter(|i| i.objective_tags.contains("obj1"))
            .count();
        assert!(obj1 >= 4);
    }

    #[test]
    fn test_insufficient_coverage_is_surfaced_not_underfilled() {
        let pool = spread_pool("obj1", 3);
        let generator = ExamGenerator::default();
        let err = generator
            .generate(&requirements(&[("obj1", 5)], 5), &pool)
            .unwrap_err();
        match err {
            EngineError::InsufficientPoolCoverage {
                objective,
                required,
                available,
            } => {
                assert_eq!(objective, "obj1");
                assert_eq!(required, 5);
                assert_eq!(available, 3);
            }
            other => panic!("expected InsufficientPoolCoverage, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_items_do_not_count_as_coverage() {
        let mut pool = spread_pool("obj1", 3);
        // Tagged but far outside the requested difficulty range.
        pool.push(item("obj1_extreme_lo", -3.5, &["obj1"]));
        pool.push(item("obj1_extreme_hi", 3.5, &["obj1"]));
        let generator = ExamGenerator::default();
        let err = generator
            .generate(&requirements(&[("obj1", 5)], 5), &pool)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientPoolCoverage { available: 3, .. }
        ));
    }

    #[test]
    fn test_selected_difficulties_span_bands() {
        let pool = spread_pool("obj1", 20);
        let generator = ExamGenerator::default();
        let exam = generator
            .generate(&requirements(&[("obj1", 8)], 8), &pool)
            .unwrap();
        let difficulties: Vec<f64> = exam
            .item_pool
            .iter()
            .map(|i| i.irt_params.difficulty)
            .collect();
        let min = difficulties.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = difficulties
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        // Stratified fill reaches into both tails of the range.
        assert!(min < -1.0, "min difficulty {min} not in the low band");
        assert!(max > 1.0, "max difficulty {max} not in the high band");
    }

    #[test]
    fn test_max_per_objective_caps_target() {
        let pool = spread_pool("obj1", 12);
        let mut req = requirements(&[("obj1", 9)], 6);
        req.constraints.max_per_objective = 6;
        let generator = ExamGenerator::default();
        let exam = generator.generate(&req, &pool).unwrap();
        let tagged = exam
            .item_pool
            .iter()
            .filter(|i| i.objective_tags.contains("obj1"))
            .count();
        assert!(tagged >= 6);
    }

    #[test]
    fn test_cancellation_discards_partial_results() {
        let mut pool = spread_pool("obj1", 8);
        pool.extend(spread_pool("obj2", 8));
        let generator = ExamGenerator::default();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = generator
            .generate_with_progress(
                &requirements(&[("obj1", 4), ("obj2", 4)], 8),
                &pool,
                &NoopProgress,
                &cancel,
            )
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_fixed_form_pool_size_matches_total() {
        let pool = spread_pool("obj1", 20);
        let generator = ExamGenerator::default();
        let exam = generator
            .generate_fixed_form(&requirements(&[("obj1", 6)], 6), &pool)
            .unwrap();
        assert_eq!(exam.item_pool.len(), 6);
    }

    #[test]
    fn test_progress_reports_each_objective() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingProgress {
            started: AtomicUsize,
            filled: AtomicUsize,
            completed: AtomicUsize,
        }
        impl GenerationProgress for CountingProgress {
            fn on_objective_start(&self, _: &str, _: usize) {
                self.started.fetch_add(1, Ordering::SeqCst);
            }
            fn on_objective_filled(&self, _: &str, _: usize) {
                self.filled.fetch_add(1, Ordering::SeqCst);
            }
            fn on_complete(&self, _: usize) {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut pool = spread_pool("obj1", 8);
        pool.extend(spread_pool("obj2", 8));
        let generator = ExamGenerator::default();
        let progress = CountingProgress {
            started: AtomicUsize::new(0),
            filled: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        };
        let outcome = generator
            .generate_with_progress(
                &requirements(&[("obj1", 3), ("obj2", 3)], 6),
                &pool,
                &progress,
                &CancelFlag::new(),
            )
            .unwrap();
        assert!(outcome.is_some());
        assert_eq!(progress.started.load(Ordering::SeqCst), 2);
        assert_eq!(progress.filled.load(Ordering::SeqCst), 2);
        assert_eq!(progress.completed.load(Ordering::SeqCst), 1);
    }
}
