use std::collections::HashMap;

use crate::curriculum::Curriculum;
use crate::error::ReportError;
use crate::models::{
    CompetencyRollup, DomainRollup, ProgressDelta, StatusCounts, StatusKey, SubCompetency,
};

#[derive(Debug, Clone)]
struct Tally {
    total: usize,
    counts: StatusCounts,
    newly_acquired: usize,
    mastered: usize,
}

impl Tally {
    fn new() -> Self {
        Self {
            total: 0,
            counts: StatusKey::all().into_iter().map(|k| (k, 0)).collect(),
            newly_acquired: 0,
            mastered: 0,
        }
    }

    fn add(&mut self, delta: &ProgressDelta) {
        self.total += 1;
        *self.counts.entry(delta.current_status).or_insert(0) += 1;
        if delta.newly_acquired {
            self.newly_acquired += 1;
        }
        if delta.current_status.is_mastery() {
            self.mastered += 1;
        }
    }

    fn merge(&mut self, other: &Tally) {
        self.total += other.total;
        for (key, count) in &other.counts {
            *self.counts.entry(*key).or_insert(0) += count;
        }
        self.newly_acquired += other.newly_acquired;
        self.mastered += other.mastered;
    }

    // Empty populations report 0 rather than dividing by zero
    fn completion_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.mastered as f64 / self.total as f64
        }
    }
}

/// Roll deltas up by competency and domain.
///
/// Rollups follow the curriculum's domain ordering. With `domain_filter`
/// only that domain is returned; an unknown id yields no rollups. Totals and
/// completion rates cover only the entries passed in, so callers decide the
/// visible population.
pub fn aggregate(
    entries: &[(&SubCompetency, ProgressDelta)],
    curriculum: &Curriculum,
    domain_filter: Option<&str>,
) -> Result<Vec<DomainRollup>, ReportError> {
    let mut by_competency: HashMap<&str, Tally> = HashMap::new();

    for (sub, delta) in entries {
        let competency = curriculum.competency_of(&sub.id).ok_or_else(|| {
            ReportError::CurriculumIntegrity(format!(
                "sub-competency '{}' is not part of the curriculum",
                sub.id
            ))
        })?;
        by_competency
            .entry(competency.id.as_str())
            .or_insert_with(Tally::new)
            .add(delta);
    }

    let rollups = curriculum
        .domains()
        .iter()
        .filter(|d| domain_filter.map_or(true, |f| d.id == f))
        .map(|domain| {
            let mut domain_tally = Tally::new();
            let competencies = domain
                .competencies
                .iter()
                .map(|competency| {
                    let tally = by_competency
                        .get(competency.id.as_str())
                        .cloned()
                        .unwrap_or_else(Tally::new);
                    domain_tally.merge(&tally);
                    CompetencyRollup {
                        competency_id: competency.id.clone(),
                        competency_name: competency.name.clone(),
                        total_sub_competencies: tally.total,
                        completion_rate: tally.completion_rate(),
                        newly_acquired_count: tally.newly_acquired,
                        counts_by_status: tally.counts,
                    }
                })
                .collect();

            DomainRollup {
                domain_id: domain.id.clone(),
                domain_name: domain.name.clone(),
                total_sub_competencies: domain_tally.total,
                completion_rate: domain_tally.completion_rate(),
                newly_acquired_count: domain_tally.newly_acquired,
                counts_by_status: domain_tally.counts,
                competencies,
            }
        })
        .collect();

    Ok(rollups)
}
