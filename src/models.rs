use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// Stored progress state for a (student, sub-competency) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
    NeedsRevision,
}

impl ProgressStatus {
    pub const ALL: [ProgressStatus; 4] = [
        ProgressStatus::NotStarted,
        ProgressStatus::InProgress,
        ProgressStatus::Completed,
        ProgressStatus::NeedsRevision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::NeedsRevision => "needs_revision",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "not_started" => Some(ProgressStatus::NotStarted),
            "in_progress" => Some(ProgressStatus::InProgress),
            "completed" => Some(ProgressStatus::Completed),
            "needs_revision" => Some(ProgressStatus::NeedsRevision),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "Not Started",
            ProgressStatus::InProgress => "In Progress",
            ProgressStatus::Completed => "Completed",
            ProgressStatus::NeedsRevision => "Needs Revision",
        }
    }

    pub fn is_mastery(&self) -> bool {
        matches!(self, ProgressStatus::Completed)
    }
}

// Outcome recorded by an evaluator for a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    NotAttempted,
    InProgress,
    Completed,
    NeedsRevision,
}

impl EvaluationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationOutcome::NotAttempted => "not_attempted",
            EvaluationOutcome::InProgress => "in_progress",
            EvaluationOutcome::Completed => "completed",
            EvaluationOutcome::NeedsRevision => "needs_revision",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "not_attempted" | "none" => Some(EvaluationOutcome::NotAttempted),
            "in_progress" | "progress" | "p" => Some(EvaluationOutcome::InProgress),
            "completed" | "complete" | "done" | "c" => Some(EvaluationOutcome::Completed),
            "needs_revision" | "revision" | "r" => Some(EvaluationOutcome::NeedsRevision),
            _ => None,
        }
    }

    /// The progress status a student is in after this outcome.
    pub fn implied_status(&self) -> ProgressStatus {
        match self {
            EvaluationOutcome::NotAttempted => ProgressStatus::NotStarted,
            EvaluationOutcome::InProgress => ProgressStatus::InProgress,
            EvaluationOutcome::Completed => ProgressStatus::Completed,
            EvaluationOutcome::NeedsRevision => ProgressStatus::NeedsRevision,
        }
    }
}

/// Display status: a stored [`ProgressStatus`] or the computed `Locked` state.
///
/// `Locked` is never persisted. It wraps the stored enum rather than extending
/// it, so nothing that writes progress can ever produce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusKey {
    Status(ProgressStatus),
    Locked,
}

impl StatusKey {
    pub const NOT_STARTED: StatusKey = StatusKey::Status(ProgressStatus::NotStarted);

    pub fn all() -> Vec<StatusKey> {
        ProgressStatus::ALL
            .iter()
            .copied()
            .map(StatusKey::Status)
            .chain(std::iter::once(StatusKey::Locked))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKey::Status(s) => s.as_str(),
            StatusKey::Locked => "locked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("locked") {
            return Some(StatusKey::Locked);
        }
        ProgressStatus::from_str(s).map(StatusKey::Status)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusKey::Status(s) => s.label(),
            StatusKey::Locked => "Locked",
        }
    }

    pub fn is_mastery(&self) -> bool {
        match self {
            StatusKey::Status(s) => s.is_mastery(),
            StatusKey::Locked => false,
        }
    }
}

impl From<ProgressStatus> for StatusKey {
    fn from(status: ProgressStatus) -> Self {
        StatusKey::Status(status)
    }
}

impl Serialize for StatusKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StatusKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StatusKey::from_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    Educator,
    Parent,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Student => "student",
            UserRole::Educator => "educator",
            UserRole::Parent => "parent",
            UserRole::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "student" => Some(UserRole::Student),
            "educator" | "teacher" => Some(UserRole::Educator),
            "parent" => Some(UserRole::Parent),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: UserRole,
}

// === Curriculum ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub name: String,
    pub ordering: i64,
    pub competencies: Vec<Competency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competency {
    pub id: String,
    pub name: String,
    pub domain_id: String,
    pub sub_competencies: Vec<SubCompetency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCompetency {
    pub id: String,
    pub name: String,
    pub competency_id: String,
    pub prerequisites: Vec<String>,
}

// === Progress ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationAttempt {
    pub id: i64,
    pub student_id: String,
    pub sub_competency_id: String,
    pub evaluated_at: DateTime<Utc>,
    pub outcome: EvaluationOutcome,
    pub evaluator_id: String,
}

// Materialized current state, derived from the latest attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub student_id: String,
    pub sub_competency_id: String,
    pub status: ProgressStatus,
    pub updated_at: DateTime<Utc>,
}

// === Report ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl ReportPeriod {
    pub fn new(start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        Self {
            start_date,
            end_date,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start_date <= self.end_date
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOptions {
    pub domain_filter: Option<String>,
    pub include_details: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDelta {
    pub sub_competency_id: String,
    pub baseline_status: Option<StatusKey>,
    pub current_status: StatusKey,
    pub changed: bool,
    pub newly_acquired: bool,
}

pub type StatusCounts = BTreeMap<StatusKey, usize>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetencyRollup {
    pub competency_id: String,
    pub competency_name: String,
    pub total_sub_competencies: usize,
    pub counts_by_status: StatusCounts,
    pub newly_acquired_count: usize,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRollup {
    pub domain_id: String,
    pub domain_name: String,
    pub total_sub_competencies: usize,
    pub counts_by_status: StatusCounts,
    pub newly_acquired_count: usize,
    pub completion_rate: f64,
    pub competencies: Vec<CompetencyRollup>,
}

impl DomainRollup {
    pub fn count(&self, status: StatusKey) -> usize {
        self.counts_by_status.get(&status).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub student_id: String,
    pub period: ReportPeriod,
    pub domain_rollups: Vec<DomainRollup>,
    pub flat_deltas: Option<Vec<ProgressDelta>>,
    pub generated_at: DateTime<Utc>,
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
