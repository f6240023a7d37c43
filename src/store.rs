use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::db::Database;
use crate::error::ReportError;
use crate::models::{Domain, EvaluationAttempt, Progress, User};

/// Resolves user identities. Read-only from the reporting engine's side.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, ReportError>;
}

/// Read access to materialized progress and evaluation history.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn find_current_progress(&self, student_id: &str) -> Result<Vec<Progress>, ReportError>;

    /// History for one sub-competency, ascending by timestamp with ties in
    /// creation order. May be non-empty even when `find_current_progress`
    /// has no record for it.
    async fn find_sub_competency_progress_history(
        &self,
        student_id: &str,
        sub_competency_id: &str,
    ) -> Result<Vec<EvaluationAttempt>, ReportError>;
}

/// Curriculum structure accessor.
#[async_trait]
pub trait CurriculumSource: Send + Sync {
    async fn list_domains(&self) -> Result<Vec<Domain>, ReportError>;
}

/// SQLite-backed implementation of all three collaborator traits.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReportError> {
        let db = Database::open(path)?;
        db.init()?;
        Ok(Self::new(db))
    }

    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, ReportError>,
    ) -> Result<T, ReportError> {
        let db = self
            .db
            .lock()
            .map_err(|_| ReportError::DataAccess("database mutex poisoned".to_string()))?;
        f(&db)
    }
}

#[async_trait]
impl IdentityLookup for SqliteStore {
    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, ReportError> {
        debug!(user_id = %id, "looking up user");
        self.with_db(|db| Ok(db.get_user(id)?))
    }
}

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn find_current_progress(&self, student_id: &str) -> Result<Vec<Progress>, ReportError> {
        self.with_db(|db| Ok(db.get_current_progress(student_id)?))
    }

    async fn find_sub_competency_progress_history(
        &self,
        student_id: &str,
        sub_competency_id: &str,
    ) -> Result<Vec<EvaluationAttempt>, ReportError> {
        self.with_db(|db| Ok(db.get_attempt_history(student_id, sub_competency_id)?))
    }
}

#[async_trait]
impl CurriculumSource for SqliteStore {
    async fn list_domains(&self) -> Result<Vec<Domain>, ReportError> {
        self.with_db(|db| db.list_domains())
    }
}
