use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failures raised anywhere in the reporting pipeline.
///
/// Lower layers return these; only the report builder catches them and turns
/// them into an [`ErrorDescriptor`] on its observable state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReportError {
    /// The student id did not resolve to a user.
    #[error("student not found: {student_id}")]
    StudentNotFound { student_id: String },

    /// Prerequisite cycle, dangling reference or otherwise malformed curriculum.
    #[error("curriculum integrity violation: {0}")]
    CurriculumIntegrity(String),

    /// Transport or backend failure from a store or lookup collaborator.
    #[error("data access failed: {0}")]
    DataAccess(String),

    #[error("invalid report period: start {start} is after end {end}")]
    InvalidPeriod {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl ReportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReportError::StudentNotFound { .. } => ErrorKind::StudentNotFound,
            ReportError::CurriculumIntegrity(_) => ErrorKind::CurriculumIntegrity,
            ReportError::DataAccess(_) => ErrorKind::DataAccess,
            ReportError::InvalidPeriod { .. } => ErrorKind::InvalidPeriod,
        }
    }

    // Transient failures may succeed on a later call; the rest indicate bad input or data
    pub fn is_transient(&self) -> bool {
        matches!(self, ReportError::DataAccess(_))
    }
}

impl From<rusqlite::Error> for ReportError {
    fn from(err: rusqlite::Error) -> Self {
        ReportError::DataAccess(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StudentNotFound,
    CurriculumIntegrity,
    DataAccess,
    InvalidPeriod,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StudentNotFound => "student_not_found",
            ErrorKind::CurriculumIntegrity => "curriculum_integrity",
            ErrorKind::DataAccess => "data_access",
            ErrorKind::InvalidPeriod => "invalid_period",
        }
    }
}

// What callers observe in place of the error itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ReportError> for ErrorDescriptor {
    fn from(err: &ReportError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
