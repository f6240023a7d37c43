use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::classifier::{classify, StatusMap};
use crate::curriculum::Curriculum;
use crate::error::ReportError;
use crate::models::{
    EvaluationAttempt, Progress, ProgressDelta, ProgressStatus, ReportPeriod, StatusKey,
    SubCompetency,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cutoff {
    /// Strictly earlier than the instant.
    Before(DateTime<Utc>),
    /// Earlier than or equal to the instant.
    AtOrBefore(DateTime<Utc>),
}

impl Cutoff {
    fn admits(&self, at: DateTime<Utc>) -> bool {
        match *self {
            Cutoff::Before(t) => at < t,
            Cutoff::AtOrBefore(t) => at <= t,
        }
    }
}

/// Status implied by the latest attempt inside the cutoff.
///
/// Attempts sharing a timestamp are resolved by record order: the one that
/// appears later in `history` wins. Stores return history ordered by
/// timestamp and then creation id, so a back-dated attempt entered after
/// another one at the same instant takes precedence.
pub fn status_at(history: &[EvaluationAttempt], cutoff: Cutoff) -> Option<ProgressStatus> {
    let mut latest: Option<&EvaluationAttempt> = None;
    for attempt in history.iter().filter(|a| cutoff.admits(a.evaluated_at)) {
        match latest {
            Some(best) if attempt.evaluated_at < best.evaluated_at => {}
            _ => latest = Some(attempt),
        }
    }
    latest.map(|a| a.outcome.implied_status())
}

/// Build the delta descriptor for a resolved (baseline, current) pair.
pub fn delta_between(
    sub_competency_id: &str,
    baseline: Option<StatusKey>,
    current: StatusKey,
) -> ProgressDelta {
    let changed = match baseline {
        None => current != StatusKey::NOT_STARTED,
        Some(b) => current != b,
    };
    let newly_acquired =
        changed && current.is_mastery() && !baseline.map_or(false, |b| b.is_mastery());

    ProgressDelta {
        sub_competency_id: sub_competency_id.to_string(),
        baseline_status: baseline,
        current_status: current,
        changed,
        newly_acquired,
    }
}

/// Statuses resolved so far at both ends of the period, used to decide
/// prerequisite locks for whatever is evaluated next.
#[derive(Debug, Clone, Default)]
pub struct ClassifierContext {
    baseline: StatusMap,
    current: StatusMap,
}

impl ClassifierContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline_statuses(&self) -> &StatusMap {
        &self.baseline
    }

    pub fn current_statuses(&self) -> &StatusMap {
        &self.current
    }

    // An absent baseline counts as NotStarted for lock propagation
    pub fn record(&mut self, delta: &ProgressDelta) {
        self.baseline.insert(
            delta.sub_competency_id.clone(),
            delta.baseline_status.unwrap_or(StatusKey::NOT_STARTED),
        );
        self.current
            .insert(delta.sub_competency_id.clone(), delta.current_status);
    }
}

/// Delta for one sub-competency over `period`.
///
/// `fallback` is the materialized progress record. It stands in for either
/// end of the period when no attempt falls inside that cutoff and the
/// record's own `updated_at` does.
pub fn compute_delta(
    sub: &SubCompetency,
    history: &[EvaluationAttempt],
    fallback: Option<&Progress>,
    period: &ReportPeriod,
    context: &ClassifierContext,
) -> Result<ProgressDelta, ReportError> {
    let from_fallback = |cutoff: Cutoff| {
        fallback
            .filter(|p| cutoff.admits(p.updated_at))
            .map(|p| p.status)
    };
    let baseline_raw = status_at(history, Cutoff::Before(period.start_date))
        .or_else(|| from_fallback(Cutoff::Before(period.start_date)));
    let current_raw = status_at(history, Cutoff::AtOrBefore(period.end_date))
        .or_else(|| from_fallback(Cutoff::AtOrBefore(period.end_date)));

    let baseline = match baseline_raw {
        Some(status) => Some(classify(Some(status), sub, context.baseline_statuses())?),
        None => None,
    };
    let current = classify(current_raw, sub, context.current_statuses())?;

    Ok(delta_between(&sub.id, baseline, current))
}

/// Deltas for every sub-competency in the curriculum, returned in curriculum
/// order. Evaluation itself follows prerequisite order so locks resolve.
pub fn compute_deltas<'a>(
    curriculum: &'a Curriculum,
    histories: &HashMap<String, Vec<EvaluationAttempt>>,
    progress: &HashMap<String, Progress>,
    period: &ReportPeriod,
) -> Result<Vec<(&'a SubCompetency, ProgressDelta)>, ReportError> {
    if !period.is_valid() {
        return Err(ReportError::InvalidPeriod {
            start: period.start_date,
            end: period.end_date,
        });
    }

    let mut context = ClassifierContext::new();
    let mut resolved: HashMap<&str, ProgressDelta> = HashMap::with_capacity(curriculum.len());

    for sub in curriculum.evaluation_order()? {
        let history = histories.get(&sub.id).map(Vec::as_slice).unwrap_or(&[]);
        let delta = compute_delta(sub, history, progress.get(&sub.id), period, &context)?;
        context.record(&delta);
        resolved.insert(sub.id.as_str(), delta);
    }

    curriculum
        .sub_competencies()
        .map(|sub| {
            resolved
                .remove(sub.id.as_str())
                .map(|delta| (sub, delta))
                .ok_or_else(|| {
                    ReportError::CurriculumIntegrity(format!(
                        "sub-competency '{}' missing from evaluation order",
                        sub.id
                    ))
                })
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::curriculum::fixtures::{competency, domain, sub};
    use crate::models::EvaluationOutcome;

    const COMPLETED: StatusKey = StatusKey::Status(ProgressStatus::Completed);
    const IN_PROGRESS: StatusKey = StatusKey::Status(ProgressStatus::InProgress);

    mod status_at_tests {
        use super::*;

        #[test]
        fn empty_history_has_no_status() {
            assert_eq!(status_at(&[], Cutoff::AtOrBefore(day(2024, 1, 31))), None);
        }

        #[test]
        fn before_excludes_the_boundary() {
            let history = vec![attempt(1, "sc1", day(2024, 1, 1), EvaluationOutcome::Completed)];
            assert_eq!(status_at(&history, Cutoff::Before(day(2024, 1, 1))), None);
            assert_eq!(
                status_at(&history, Cutoff::AtOrBefore(day(2024, 1, 1))),
                Some(ProgressStatus::Completed)
            );
        }

        #[test]
        fn latest_attempt_wins() {
            let history = vec![
                attempt(1, "sc1", day(2023, 12, 1), EvaluationOutcome::InProgress),
                attempt(2, "sc1", day(2023, 12, 20), EvaluationOutcome::NeedsRevision),
                attempt(3, "sc1", day(2024, 1, 10), EvaluationOutcome::Completed),
            ];
            assert_eq!(
                status_at(&history, Cutoff::Before(day(2024, 1, 1))),
                Some(ProgressStatus::NeedsRevision)
            );
        }

        #[test]
        fn same_timestamp_resolves_by_record_order() {
            let history = vec![
                attempt(1, "sc1", day(2024, 1, 10), EvaluationOutcome::Completed),
                attempt(2, "sc1", day(2024, 1, 10), EvaluationOutcome::NeedsRevision),
            ];
            assert_eq!(
                status_at(&history, Cutoff::AtOrBefore(day(2024, 1, 31))),
                Some(ProgressStatus::NeedsRevision)
            );

            let reversed: Vec<_> = history.into_iter().rev().collect();
            assert_eq!(
                status_at(&reversed, Cutoff::AtOrBefore(day(2024, 1, 31))),
                Some(ProgressStatus::Completed)
            );
        }

        #[test]
        fn back_dated_attempt_entered_later_is_not_shadowed_by_position() {
            // Entered last but dated earlier: timestamp still decides
            let history = vec![
                attempt(1, "sc1", day(2024, 1, 20), EvaluationOutcome::Completed),
                attempt(2, "sc1", day(2024, 1, 5), EvaluationOutcome::InProgress),
            ];
            assert_eq!(
                status_at(&history, Cutoff::AtOrBefore(day(2024, 1, 31))),
                Some(ProgressStatus::Completed)
            );
        }

        #[test]
        fn not_attempted_implies_not_started() {
            let history = vec![attempt(1, "sc1", day(2024, 1, 2), EvaluationOutcome::NotAttempted)];
            assert_eq!(
                status_at(&history, Cutoff::AtOrBefore(day(2024, 1, 31))),
                Some(ProgressStatus::NotStarted)
            );
        }
    }

    mod delta_between_tests {
        use super::*;

        fn all_baselines() -> Vec<Option<StatusKey>> {
            std::iter::once(None)
                .chain(StatusKey::all().into_iter().map(Some))
                .collect()
        }

        #[test]
        fn newly_acquired_iff_mastery_reached() {
            for baseline in all_baselines() {
                for current in StatusKey::all() {
                    let delta = delta_between("sc", baseline, current);
                    let expected =
                        current.is_mastery() && !baseline.map_or(false, |b| b.is_mastery());
                    assert_eq!(
                        delta.newly_acquired, expected,
                        "baseline {:?} current {:?}",
                        baseline, current
                    );
                    if delta.newly_acquired {
                        assert!(delta.changed);
                    }
                }
            }
        }

        #[test]
        fn changed_iff_concrete_baseline_differs() {
            for baseline in StatusKey::all() {
                for current in StatusKey::all() {
                    let delta = delta_between("sc", Some(baseline), current);
                    assert_eq!(delta.changed, baseline != current);
                }
            }
        }

        #[test]
        fn absent_baseline_changes_unless_still_not_started() {
            assert!(!delta_between("sc", None, StatusKey::NOT_STARTED).changed);
            assert!(delta_between("sc", None, IN_PROGRESS).changed);
            assert!(delta_between("sc", None, StatusKey::Locked).changed);
            assert!(delta_between("sc", None, COMPLETED).changed);
        }

        #[test]
        fn regression_from_mastery_is_change_but_not_acquisition() {
            let delta = delta_between(
                "sc",
                Some(COMPLETED),
                StatusKey::Status(ProgressStatus::NeedsRevision),
            );
            assert!(delta.changed);
            assert!(!delta.newly_acquired);
        }
    }

    mod compute_delta_tests {
        use super::*;

        #[test]
        fn completion_inside_period_with_no_baseline() {
            let sc1 = sub("sc1", "c", &[]);
            let history = vec![attempt(1, "sc1", day(2024, 1, 15), EvaluationOutcome::Completed)];

            let delta =
                compute_delta(&sc1, &history, None, &january_2024(), &ClassifierContext::new())
                    .unwrap();

            assert_eq!(delta.baseline_status, None);
            assert_eq!(delta.current_status, COMPLETED);
            assert!(delta.changed);
            assert!(delta.newly_acquired);
        }

        #[test]
        fn attempts_after_period_are_ignored() {
            let sc1 = sub("sc1", "c", &[]);
            let history = vec![
                attempt(1, "sc1", day(2023, 12, 15), EvaluationOutcome::InProgress),
                attempt(2, "sc1", day(2024, 2, 10), EvaluationOutcome::Completed),
            ];

            let delta =
                compute_delta(&sc1, &history, None, &january_2024(), &ClassifierContext::new())
                    .unwrap();

            assert_eq!(delta.baseline_status, Some(IN_PROGRESS));
            assert_eq!(delta.current_status, IN_PROGRESS);
            assert!(!delta.changed);
        }

        #[test]
        fn already_mastered_before_period_is_not_new() {
            let sc1 = sub("sc1", "c", &[]);
            let history = vec![
                attempt(1, "sc1", day(2023, 11, 1), EvaluationOutcome::Completed),
                attempt(2, "sc1", day(2024, 1, 12), EvaluationOutcome::Completed),
            ];

            let delta =
                compute_delta(&sc1, &history, None, &january_2024(), &ClassifierContext::new())
                    .unwrap();

            assert_eq!(delta.baseline_status, Some(COMPLETED));
            assert!(!delta.changed);
            assert!(!delta.newly_acquired);
        }

        #[test]
        fn materialized_progress_fills_missing_history() {
            let sc1 = sub("sc1", "c", &[]);
            let progress = Progress {
                student_id: "s1".to_string(),
                sub_competency_id: "sc1".to_string(),
                status: ProgressStatus::InProgress,
                updated_at: day(2024, 1, 3),
            };

            let delta = compute_delta(
                &sc1,
                &[],
                Some(&progress),
                &january_2024(),
                &ClassifierContext::new(),
            )
            .unwrap();
            assert_eq!(delta.current_status, IN_PROGRESS);

            let later = Progress {
                updated_at: day(2024, 3, 1),
                ..progress
            };
            let delta = compute_delta(
                &sc1,
                &[],
                Some(&later),
                &january_2024(),
                &ClassifierContext::new(),
            )
            .unwrap();
            assert_eq!(delta.current_status, StatusKey::NOT_STARTED);
        }

        #[test]
        fn materialized_progress_before_period_is_baseline() {
            let sc1 = sub("sc1", "c", &[]);
            let progress = Progress {
                student_id: "s1".to_string(),
                sub_competency_id: "sc1".to_string(),
                status: ProgressStatus::Completed,
                updated_at: day(2023, 6, 1),
            };

            let delta = compute_delta(
                &sc1,
                &[],
                Some(&progress),
                &january_2024(),
                &ClassifierContext::new(),
            )
            .unwrap();
            assert_eq!(delta.baseline_status, Some(COMPLETED));
            assert_eq!(delta.current_status, COMPLETED);
            assert!(!delta.changed);
            assert!(!delta.newly_acquired);
        }

        #[test]
        fn materialized_baseline_respects_prerequisite_locks() {
            let sc2 = sub("sc2", "c", &["sc1"]);
            let progress = Progress {
                student_id: "s1".to_string(),
                sub_competency_id: "sc2".to_string(),
                status: ProgressStatus::Completed,
                updated_at: day(2023, 6, 1),
            };
            let mut context = ClassifierContext::new();
            context.record(&delta_between("sc1", None, COMPLETED));

            let delta = compute_delta(&sc2, &[], Some(&progress), &january_2024(), &context)
                .unwrap();
            assert_eq!(delta.baseline_status, Some(StatusKey::Locked));
            assert_eq!(delta.current_status, COMPLETED);
            assert!(delta.newly_acquired);
        }

        #[test]
        fn lock_applies_at_each_end_of_the_period() {
            let sc2 = sub("sc2", "c", &["sc1"]);
            let history = vec![
                attempt(1, "sc2", day(2023, 12, 1), EvaluationOutcome::InProgress),
                attempt(2, "sc2", day(2024, 1, 20), EvaluationOutcome::Completed),
            ];

            // sc1 unmastered at the start, mastered by the end
            let mut context = ClassifierContext::new();
            context.record(&delta_between("sc1", Some(IN_PROGRESS), COMPLETED));

            let delta = compute_delta(&sc2, &history, None, &january_2024(), &context).unwrap();
            assert_eq!(delta.baseline_status, Some(StatusKey::Locked));
            assert_eq!(delta.current_status, COMPLETED);
            assert!(delta.newly_acquired);
        }
    }

    mod compute_deltas_tests {
        use super::*;

        fn chain_curriculum() -> Curriculum {
            Curriculum::new(vec![domain(
                "math",
                1,
                vec![competency(
                    "add",
                    "math",
                    vec![
                        sub("sc3", "add", &["sc2"]),
                        sub("sc1", "add", &[]),
                        sub("sc2", "add", &["sc1"]),
                    ],
                )],
            )])
            .unwrap()
        }

        #[test]
        fn returns_curriculum_order() {
            let curriculum = chain_curriculum();
            let deltas =
                compute_deltas(&curriculum, &HashMap::new(), &HashMap::new(), &january_2024())
                    .unwrap();

            let order: Vec<&str> = deltas.iter().map(|(s, _)| s.id.as_str()).collect();
            assert_eq!(order, vec!["sc3", "sc1", "sc2"]);
        }

        #[test]
        fn locking_is_transitive() {
            let curriculum = chain_curriculum();
            let mut histories = HashMap::new();
            histories.insert(
                "sc3".to_string(),
                vec![attempt(1, "sc3", day(2024, 1, 5), EvaluationOutcome::Completed)],
            );

            let deltas =
                compute_deltas(&curriculum, &histories, &HashMap::new(), &january_2024()).unwrap();
            let by_id: HashMap<&str, &ProgressDelta> =
                deltas.iter().map(|(s, d)| (s.id.as_str(), d)).collect();

            assert_eq!(by_id["sc1"].current_status, StatusKey::NOT_STARTED);
            assert_eq!(by_id["sc2"].current_status, StatusKey::Locked);
            assert_eq!(by_id["sc3"].current_status, StatusKey::Locked);
        }

        #[test]
        fn mastering_the_chain_unlocks_everything() {
            let curriculum = chain_curriculum();
            let mut histories = HashMap::new();
            for (i, id) in ["sc1", "sc2", "sc3"].iter().enumerate() {
                histories.insert(
                    id.to_string(),
                    vec![attempt(i as i64, id, day(2024, 1, 10), EvaluationOutcome::Completed)],
                );
            }

            let deltas =
                compute_deltas(&curriculum, &histories, &HashMap::new(), &january_2024()).unwrap();
            assert!(deltas.iter().all(|(_, d)| d.current_status == COMPLETED));
            assert!(deltas.iter().all(|(_, d)| d.newly_acquired));
        }

        #[test]
        fn cyclic_curriculum_fails() {
            let curriculum = Curriculum::new(vec![domain(
                "math",
                1,
                vec![competency(
                    "add",
                    "math",
                    vec![sub("a", "add", &["b"]), sub("b", "add", &["a"])],
                )],
            )])
            .unwrap();

            let result =
                compute_deltas(&curriculum, &HashMap::new(), &HashMap::new(), &january_2024());
            assert!(matches!(result, Err(ReportError::CurriculumIntegrity(_))));
        }

        #[test]
        fn inverted_period_fails() {
            let curriculum = chain_curriculum();
            let period = ReportPeriod::new(day(2024, 2, 1), day(2024, 1, 1));
            let result = compute_deltas(&curriculum, &HashMap::new(), &HashMap::new(), &period);
            assert!(matches!(result, Err(ReportError::InvalidPeriod { .. })));
        }
    }
}
