use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::curriculum::Curriculum;
use crate::error::{ErrorDescriptor, ReportError};
use crate::models::{Report, ReportOptions, ReportPeriod, UserRole};
use crate::report::assemble_report;
use crate::store::{CurriculumSource, IdentityLookup, ProgressStore};

/// Observable state of a [`ReportBuilder`].
///
/// The last successful report survives both a new load and a failure, so a
/// UI can keep showing it next to a spinner or an error banner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReportState {
    Idle,
    Loading {
        previous: Option<Report>,
    },
    Success {
        report: Report,
    },
    Failure {
        error: ErrorDescriptor,
        previous: Option<Report>,
    },
}

impl ReportState {
    pub fn is_loading(&self) -> bool {
        matches!(self, ReportState::Loading { .. })
    }

    pub fn error(&self) -> Option<&ErrorDescriptor> {
        match self {
            ReportState::Failure { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn report_data(&self) -> Option<&Report> {
        match self {
            ReportState::Idle => None,
            ReportState::Success { report } => Some(report),
            ReportState::Loading { previous } | ReportState::Failure { previous, .. } => {
                previous.as_ref()
            }
        }
    }
}

/// Flat loading/error/data view of [`ReportState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSnapshot {
    pub loading: bool,
    pub error: Option<ErrorDescriptor>,
    pub report_data: Option<Report>,
}

impl From<&ReportState> for ReportSnapshot {
    fn from(state: &ReportState) -> Self {
        Self {
            loading: state.is_loading(),
            error: state.error().cloned(),
            report_data: state.report_data().cloned(),
        }
    }
}

/// Generates progress reports and owns the state they are published to.
///
/// Overlapping calls are allowed. Each call draws a generation token; only
/// the most recently started call may publish, so a slow earlier call that
/// resolves late never overwrites a newer outcome.
pub struct ReportBuilder {
    identity: Arc<dyn IdentityLookup>,
    progress: Arc<dyn ProgressStore>,
    curriculum: Arc<dyn CurriculumSource>,
    state: watch::Sender<ReportState>,
    generation: AtomicU64,
}

impl ReportBuilder {
    pub fn new(
        identity: Arc<dyn IdentityLookup>,
        progress: Arc<dyn ProgressStore>,
        curriculum: Arc<dyn CurriculumSource>,
    ) -> Self {
        let (state, _) = watch::channel(ReportState::Idle);
        Self {
            identity,
            progress,
            curriculum,
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: IdentityLookup + ProgressStore + CurriculumSource + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    pub fn subscribe(&self) -> watch::Receiver<ReportState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ReportState {
        self.state.borrow().clone()
    }

    pub fn snapshot(&self) -> ReportSnapshot {
        ReportSnapshot::from(&*self.state.borrow())
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading()
    }

    pub fn error(&self) -> Option<ErrorDescriptor> {
        self.state.borrow().error().cloned()
    }

    pub fn report_data(&self) -> Option<Report> {
        self.state.borrow().report_data().cloned()
    }

    /// Generate a report and publish the outcome.
    ///
    /// Resolves to the report, or `None` with the error recorded in state.
    /// A call superseded by a later one still returns its own result to its
    /// caller but leaves the published state alone.
    pub async fn generate_report(
        &self,
        student_id: &str,
        period: ReportPeriod,
        options: ReportOptions,
    ) -> Option<Report> {
        let token = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(token, |state| ReportState::Loading {
            previous: state.report_data().cloned(),
        });

        match self.build(student_id, &period, &options).await {
            Ok(report) => {
                info!(
                    student_id = %student_id,
                    domains = report.domain_rollups.len(),
                    "report generated"
                );
                self.publish(token, |_| ReportState::Success {
                    report: report.clone(),
                });
                Some(report)
            }
            Err(err) => {
                warn!(
                    student_id = %student_id,
                    kind = err.kind().as_str(),
                    transient = err.is_transient(),
                    error = %err,
                    "report generation failed"
                );
                let error = ErrorDescriptor::from(&err);
                self.publish(token, |state| ReportState::Failure {
                    error,
                    previous: state.report_data().cloned(),
                });
                None
            }
        }
    }

    // Single mutation point; the token check runs under the channel lock
    fn publish(&self, token: u64, next: impl FnOnce(&ReportState) -> ReportState) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != token {
                debug!(token, "discarding superseded report result");
                return false;
            }
            *state = next(state);
            true
        })
    }

    async fn build(
        &self,
        student_id: &str,
        period: &ReportPeriod,
        options: &ReportOptions,
    ) -> Result<Report, ReportError> {
        if !period.is_valid() {
            return Err(ReportError::InvalidPeriod {
                start: period.start_date,
                end: period.end_date,
            });
        }

        // The student must exist before any progress is fetched
        let student = self
            .identity
            .find_user_by_id(student_id)
            .await?
            .filter(|user| user.role == UserRole::Student)
            .ok_or_else(|| ReportError::StudentNotFound {
                student_id: student_id.to_string(),
            })?;
        debug!(student_id = %student.id, "student resolved");

        let curriculum = Curriculum::new(self.curriculum.list_domains().await?)?;

        if let Some(filter) = options.domain_filter.as_deref() {
            if curriculum.domain(filter).is_none() {
                warn!(domain_id = %filter, "domain filter matches no domain");
            }
        }

        let mut progress = HashMap::new();
        for record in self.progress.find_current_progress(student_id).await? {
            if !curriculum.contains(&record.sub_competency_id) {
                warn!(
                    student_id = %student_id,
                    sub_competency_id = %record.sub_competency_id,
                    "progress for sub-competency outside the curriculum ignored"
                );
                continue;
            }
            progress.insert(record.sub_competency_id.clone(), record);
        }

        // History is read for every sub-competency, not only those with a
        // materialized record
        let mut histories = HashMap::with_capacity(curriculum.len());
        for sub in curriculum.sub_competencies() {
            let history = self
                .progress
                .find_sub_competency_progress_history(student_id, &sub.id)
                .await?;
            if !history.is_empty() {
                if !progress.contains_key(&sub.id) {
                    debug!(
                        student_id = %student_id,
                        sub_competency_id = %sub.id,
                        attempts = history.len(),
                        "history without materialized progress"
                    );
                }
                histories.insert(sub.id.clone(), history);
            }
        }
        debug!(
            student_id = %student_id,
            tracked = progress.len(),
            curriculum = curriculum.len(),
            "progress fetched"
        );

        assemble_report(
            student_id,
            period,
            options,
            &curriculum,
            &histories,
            &progress,
            Utc::now(),
        )
    }
}
