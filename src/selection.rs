//! Maximum-information item selection with soft exposure control.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::ExposureConfig;
use crate::irt;
use crate::types::QuestionItem;

/// Administration tallies shared across concurrent sessions. Exposure
/// control is a soft heuristic, so relaxed atomics are sufficient.
#[derive(Debug, Default)]
pub struct ExposureLedger {
    counts: RwLock<HashMap<String, AtomicU64>>,
}

impl ExposureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a counter from the persisted snapshot if not already present.
    pub fn register(&self, item_id: &str, initial: u64) {
        let mut counts = self.counts.write();
        counts
            .entry(item_id.to_string())
            .or_insert_with(|| AtomicU64::new(initial));
    }

    pub fn record(&self, item_id: &str) {
        {
            let counts = self.counts.read();
            if let Some(counter) = counts.get(item_id) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counts = self.counts.write();
        counts
            .entry(item_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, item_id: &str) -> u64 {
        self.counts
            .read()
            .get(item_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOutcome {
    pub item_id: String,
    pub information: f64,
    pub candidates: usize,
    pub exposure_penalized: bool,
}

#[derive(Debug, Clone)]
pub struct ItemSelector {
    config: ExposureConfig,
}

impl Default for ItemSelector {
    fn default() -> Self {
        Self::new(ExposureConfig::default())
    }
}

impl ItemSelector {
    pub fn new(config: ExposureConfig) -> Self {
        Self { config }
    }

    /// Pick the next item to administer, or `None` when no eligible item
    /// remains (a normal pool-exhausted signal, not an error).
    ///
    /// Eligibility: not yet administered this session, and at least one of
    /// the item's objective tags still has room under `max_per_objective`.
    /// Among eligible items the highest exposure-weighted Fisher
    /// information wins; ties break on lowest exposure count, then
    /// lexicographically smallest item id.
    pub fn select_next<'a>(
        &self,
        pool: &'a [QuestionItem],
        administered: &HashSet<&str>,
        objective_counts: &HashMap<&str, usize>,
        max_per_objective: usize,
        theta: f64,
        ledger: &ExposureLedger,
    ) -> Option<(&'a QuestionItem, SelectionOutcome)> {
        let exposure_cutoff = self.exposure_cutoff(pool, ledger);

        let mut candidates = 0usize;
        let mut best: Option<(&QuestionItem, f64, u64, bool)> = None;

        for item in pool {
            if administered.contains(item.item_id.as_str()) {
                continue;
            }
            if !self.objective_room(item, objective_counts, max_per_objective) {
                continue;
            }
            candidates += 1;

            let exposure = ledger.count(&item.item_id);
            let penalized = exposure_cutoff.is_some_and(|cutoff| exposure >= cutoff);
            let mut score = irt::information(theta, &item.irt_params);
            if penalized {
                score *= self.config.penalty;
            }

            let replace = match best {
                None => true,
                Some((current, best_score, best_exposure, _)) => {
                    if score > best_score {
                        true
                    } else if score < best_score {
                        false
                    } else if exposure != best_exposure {
                        exposure < best_exposure
                    } else {
                        item.item_id < current.item_id
                    }
                }
            };
            if replace {
                best = Some((item, score, exposure, penalized));
            }
        }

        best.map(|(item, information, _, exposure_penalized)| {
            (
                item,
                SelectionOutcome {
                    item_id: item.item_id.clone(),
                    information,
                    candidates,
                    exposure_penalized,
                },
            )
        })
    }

    fn objective_room(
        &self,
        item: &QuestionItem,
        objective_counts: &HashMap<&str, usize>,
        max_per_objective: usize,
    ) -> bool {
        if item.objective_tags.is_empty() {
            return true;
        }
        item.objective_tags.iter().any(|tag| {
            objective_counts.get(tag.as_str()).copied().unwrap_or(0) < max_per_objective
        })
    }

    /// Exposure count at the configured percentile of the pool; `None` when
    /// nothing has been administered yet.
    fn exposure_cutoff(&self, pool: &[QuestionItem], ledger: &ExposureLedger) -> Option<u64> {
        if pool.is_empty() {
            return None;
        }
        let mut counts: Vec<u64> = pool.iter().map(|i| ledger.count(&i.item_id)).collect();
        if counts.iter().all(|&c| c == 0) {
            return None;
        }
        counts.sort_unstable();
        let rank = ((counts.len() as f64 - 1.0) * self.config.percentile).round() as usize;
        // Never penalize items that were not administered at all.
        Some(counts[rank.min(counts.len() - 1)].max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnswerKey, IrtParams, QuestionType};
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

    #[test]
    fn test_selects_maximum_information_item() {
        let pool = vec![
            item("q1", -2.0, &["obj1"]),
            item("q2", 0.0, &["obj1"]),
            item("q3", 2.0, &["obj1"]),
        ];
        let selector = ItemSelector::default();
        let ledger = ExposureLedger::new();
        let (picked, outcome) = selector
            .select_next(&pool, &HashSet::new(), &HashMap::new(), 10, 0.0, &ledger)
            .unwrap();
        assert_eq!(picked.item_id, "q2");
        assert_eq!(outcome.candidates, 3);
        assert!(outcome.information > 0.0);
    }

    #[test]
    fn test_never_returns_administered_item() {
        let pool = vec![item("q1", 0.0, &["obj1"]), item("q2", 0.1, &["obj1"])];
        let selector = ItemSelector::default();
        let ledger = ExposureLedger::new();
        let mut administered = HashSet::new();
        administered.insert("q1");
        let (picked, _) = selector
            .select_next(&pool, &administered, &HashMap::new(), 10, 0.0, &ledger)
            .unwrap();
        assert_eq!(picked.item_id, "q2");
        administered.insert("q2");
        assert!(selector
            .select_next(&pool, &administered, &HashMap::new(), 10, 0.0, &ledger)
            .is_none());
    }

    #[test]
    fn test_objective_cap_filters_items() {
        let pool = vec![item("q1", 0.0, &["obj1"]), item("q2", 0.0, &["obj2"])];
        let selector = ItemSelector::default();
        let ledger = ExposureLedger::new();
        let mut counts = HashMap::new();
        counts.insert("obj1", 2);
        let (picked, _) = selector
            .select_next(&pool, &HashSet::new(), &counts, 2, 0.0, &ledger)
            .unwrap();
        assert_eq!(picked.item_id, "q2");
    }

    #[test]
    fn test_tie_breaks_on_exposure_then_id() {
        // Identical parameters: identical information at any θ.
        let pool = vec![item("q2", 0.0, &["obj1"]), item("q1", 0.0, &["obj1"])];
        let selector = ItemSelector::default();
        let ledger = ExposureLedger::new();
        let (picked, _) = selector
            .select_next(&pool, &HashSet::new(), &HashMap::new(), 10, 0.0, &ledger)
            .unwrap();
        assert_eq!(picked.item_id, "q1");

        // Give q1 a higher exposure count; q2 should win the tie now.
        ledger.record("q1");
        ledger.record("q1");
        ledger.record("q1");
        let (picked, _) = selector
            .select_next(&pool, &HashSet::new(), &HashMap::new(), 10, 0.0, &ledger)
            .unwrap();
        assert_eq!(picked.item_id, "q2");
    }

    #[test]
    fn test_exposure_downweights_not_excludes() {
        let pool = vec![item("q1", 0.0, &["obj1"])];
        let selector = ItemSelector::default();
        let ledger = ExposureLedger::new();
        for _ in 0..50 {
            ledger.record("q1");
        }
        // The only item is over-exposed yet still returned.
        let (picked, outcome) = selector
            .select_next(&pool, &HashSet::new(), &HashMap::new(), 10, 0.0, &ledger)
            .unwrap();
        assert_eq!(picked.item_id, "q1");
        assert!(outcome.exposure_penalized);
    }

    #[test]
    fn test_ledger_counts() {
        let ledger = ExposureLedger::new();
        ledger.register("q1", 7);
        assert_eq!(ledger.count("q1"), 7);
        ledger.record("q1");
        assert_eq!(ledger.count("q1"), 8);
        ledger.record("q_unseen");
        assert_eq!(ledger.count("q_unseen"), 1);
    }
}
