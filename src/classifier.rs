use std::collections::HashMap;

use crate::error::ReportError;
use crate::models::{Progress, ProgressStatus, StatusKey, SubCompetency};

/// Resolved statuses keyed by sub-competency id.
pub type StatusMap = HashMap<String, StatusKey>;

/// Classify one sub-competency from its stored status and the already
/// resolved statuses of its prerequisites.
///
/// Any prerequisite that is not mastered locks the sub-competency, whatever
/// was stored for it. Since `Locked` is not mastery, locking is transitive as
/// long as callers walk [`Curriculum::evaluation_order`]. A prerequisite
/// missing from `prerequisite_statuses` means that order was not followed.
///
/// [`Curriculum::evaluation_order`]: crate::curriculum::Curriculum::evaluation_order
pub fn classify(
    stored: Option<ProgressStatus>,
    sub: &SubCompetency,
    prerequisite_statuses: &StatusMap,
) -> Result<StatusKey, ReportError> {
    for prereq in &sub.prerequisites {
        let status = prerequisite_statuses.get(prereq).ok_or_else(|| {
            ReportError::CurriculumIntegrity(format!(
                "prerequisite '{}' of '{}' was not resolved before it",
                prereq, sub.id
            ))
        })?;
        if !status.is_mastery() {
            return Ok(StatusKey::Locked);
        }
    }

    Ok(stored.map(StatusKey::from).unwrap_or(StatusKey::NOT_STARTED))
}

pub fn classify_progress(
    progress: Option<&Progress>,
    sub: &SubCompetency,
    prerequisite_statuses: &StatusMap,
) -> Result<StatusKey, ReportError> {
    classify(progress.map(|p| p.status), sub, prerequisite_statuses)
}
