use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::aggregate::aggregate;
use crate::curriculum::Curriculum;
use crate::delta::compute_deltas;
use crate::error::ReportError;
use crate::models::{EvaluationAttempt, Progress, Report, ReportOptions, ReportPeriod};

/// Assemble a report from already-fetched data. Synchronous and pure apart
/// from the supplied `generated_at`.
///
/// The domain filter narrows both the rollups and the detail list; deltas are
/// still computed over the whole curriculum because prerequisites may cross
/// domains.
pub fn assemble_report(
    student_id: &str,
    period: &ReportPeriod,
    options: &ReportOptions,
    curriculum: &Curriculum,
    histories: &HashMap<String, Vec<EvaluationAttempt>>,
    progress: &HashMap<String, Progress>,
    generated_at: DateTime<Utc>,
) -> Result<Report, ReportError> {
    let deltas = compute_deltas(curriculum, histories, progress, period)?;

    let visible: Vec<_> = match options.domain_filter.as_deref() {
        Some(filter) => deltas
            .into_iter()
            .filter(|(sub, _)| curriculum.domain_of(&sub.id).map_or(false, |d| d.id == filter))
            .collect(),
        None => deltas,
    };

    let domain_rollups = aggregate(&visible, curriculum, options.domain_filter.as_deref())?;

    let flat_deltas = if options.include_details {
        Some(visible.into_iter().map(|(_, delta)| delta).collect())
    } else {
        None
    };

    Ok(Report {
        student_id: student_id.to_string(),
        period: *period,
        domain_rollups,
        flat_deltas,
        generated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::fixtures::{competency, domain, sub};
    use crate::delta::fixtures::{attempt, day, january_2024};
    use crate::models::{EvaluationOutcome, ProgressStatus, StatusKey};

    fn curriculum() -> Curriculum {
        Curriculum::new(vec![
            domain(
                "math",
                1,
                vec![competency(
                    "add",
                    "math",
                    vec![sub("sc1", "add", &[]), sub("sc2", "add", &["sc1"])],
                )],
            ),
            domain(
                "reading",
                2,
                vec![competency("phonics", "reading", vec![sub("r1", "phonics", &[])])],
            ),
        ])
        .unwrap()
    }

    fn options(domain_filter: Option<&str>, include_details: bool) -> ReportOptions {
        ReportOptions {
            domain_filter: domain_filter.map(str::to_string),
            include_details,
        }
    }

    #[test]
    fn empty_history_reports_zero_everywhere() {
        let report = assemble_report(
            "s1",
            &january_2024(),
            &options(None, true),
            &curriculum(),
            &HashMap::new(),
            &HashMap::new(),
            day(2024, 2, 1),
        )
        .unwrap();

        assert_eq!(report.domain_rollups.len(), 2);
        assert!(report.domain_rollups.iter().all(|r| r.completion_rate == 0.0));
        assert!(report.domain_rollups.iter().all(|r| r.newly_acquired_count == 0));

        let deltas = report.flat_deltas.unwrap();
        assert_eq!(deltas.len(), 3);
        assert!(deltas.iter().all(|d| d.baseline_status.is_none()));
    }

    #[test]
    fn details_omitted_unless_requested() {
        let report = assemble_report(
            "s1",
            &january_2024(),
            &options(None, false),
            &curriculum(),
            &HashMap::new(),
            &HashMap::new(),
            day(2024, 2, 1),
        )
        .unwrap();
        assert!(report.flat_deltas.is_none());
    }

    #[test]
    fn filter_narrows_rollups_and_details() {
        let mut histories = HashMap::new();
        histories.insert(
            "r1".to_string(),
            vec![attempt(1, "r1", day(2024, 1, 9), EvaluationOutcome::Completed)],
        );

        let report = assemble_report(
            "s1",
            &january_2024(),
            &options(Some("reading"), true),
            &curriculum(),
            &histories,
            &HashMap::new(),
            day(2024, 2, 1),
        )
        .unwrap();

        assert_eq!(report.domain_rollups.len(), 1);
        assert_eq!(report.domain_rollups[0].domain_id, "reading");
        assert_eq!(report.domain_rollups[0].completion_rate, 1.0);

        let deltas = report.flat_deltas.unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].sub_competency_id, "r1");
        assert!(deltas[0].newly_acquired);
    }

    #[test]
    fn filter_still_honours_cross_domain_prerequisites() {
        let curriculum = Curriculum::new(vec![
            domain(
                "math",
                1,
                vec![competency("word", "math", vec![sub("m1", "word", &["r1"])])],
            ),
            domain(
                "reading",
                2,
                vec![competency("phonics", "reading", vec![sub("r1", "phonics", &[])])],
            ),
        ])
        .unwrap();
        let mut histories = HashMap::new();
        histories.insert(
            "m1".to_string(),
            vec![attempt(1, "m1", day(2024, 1, 9), EvaluationOutcome::Completed)],
        );

        let report = assemble_report(
            "s1",
            &january_2024(),
            &options(Some("math"), true),
            &curriculum,
            &histories,
            &HashMap::new(),
            day(2024, 2, 1),
        )
        .unwrap();

        let deltas = report.flat_deltas.unwrap();
        assert_eq!(deltas[0].current_status, StatusKey::Locked);
        assert_eq!(report.domain_rollups[0].count(StatusKey::Locked), 1);
    }

    #[test]
    fn progress_records_feed_current_state() {
        let mut progress = HashMap::new();
        progress.insert(
            "sc1".to_string(),
            Progress {
                student_id: "s1".to_string(),
                sub_competency_id: "sc1".to_string(),
                status: ProgressStatus::Completed,
                updated_at: day(2023, 12, 1),
            },
        );

        let report = assemble_report(
            "s1",
            &january_2024(),
            &options(Some("math"), true),
            &curriculum(),
            &HashMap::new(),
            &progress,
            day(2024, 2, 1),
        )
        .unwrap();

        assert_eq!(report.domain_rollups[0].completion_rate, 0.5);
    }
}
