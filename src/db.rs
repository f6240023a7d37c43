use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result};

use crate::error::ReportError;
use crate::models::{
    Competency, Domain, EvaluationAttempt, EvaluationOutcome, Progress, ProgressStatus,
    SubCompetency, User, UserRole,
};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('student', 'educator', 'parent', 'admin')),
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS domains (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                ordering INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS competencies (
                id TEXT PRIMARY KEY,
                domain_id TEXT NOT NULL,
                name TEXT NOT NULL,
                FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS sub_competencies (
                id TEXT PRIMARY KEY,
                competency_id TEXT NOT NULL,
                name TEXT NOT NULL,
                FOREIGN KEY (competency_id) REFERENCES competencies(id) ON DELETE CASCADE
            );

            -- Ordered prerequisite lists
            CREATE TABLE IF NOT EXISTS sub_competency_prerequisites (
                sub_competency_id TEXT NOT NULL,
                prerequisite_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (sub_competency_id, prerequisite_id),
                FOREIGN KEY (sub_competency_id) REFERENCES sub_competencies(id) ON DELETE CASCADE,
                FOREIGN KEY (prerequisite_id) REFERENCES sub_competencies(id) ON DELETE CASCADE
            );

            -- Append-only evaluation history; id doubles as record order
            CREATE TABLE IF NOT EXISTS evaluation_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                sub_competency_id TEXT NOT NULL,
                evaluated_at TEXT NOT NULL,
                outcome TEXT NOT NULL CHECK(outcome IN ('not_attempted', 'in_progress', 'completed', 'needs_revision')),
                evaluator_id TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (student_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (sub_competency_id) REFERENCES sub_competencies(id) ON DELETE CASCADE
            );

            -- Materialized current state per (student, sub-competency)
            CREATE TABLE IF NOT EXISTS student_progress (
                student_id TEXT NOT NULL,
                sub_competency_id TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('not_started', 'in_progress', 'completed', 'needs_revision')),
                updated_at TEXT NOT NULL,
                PRIMARY KEY (student_id, sub_competency_id),
                FOREIGN KEY (student_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (sub_competency_id) REFERENCES sub_competencies(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_competencies_domain ON competencies(domain_id);
            CREATE INDEX IF NOT EXISTS idx_sub_competencies_competency ON sub_competencies(competency_id);
            CREATE INDEX IF NOT EXISTS idx_attempts_student_sub ON evaluation_attempts(student_id, sub_competency_id, evaluated_at);
            CREATE INDEX IF NOT EXISTS idx_progress_student ON student_progress(student_id);
            "#,
        )?;

        Ok(())
    }

    // User operations
    pub fn add_user(&self, id: &str, name: &str, role: UserRole) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, name, role) VALUES (?1, ?2, ?3)",
            params![id, name, role.as_str()],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, name, role FROM users WHERE id = ?1",
                params![id],
                |row| {
                    let role: String = row.get(2)?;
                    Ok(User {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        role: UserRole::from_str(&role)
                            .ok_or_else(|| bad_value(2, format!("unknown role '{}'", role)))?,
                    })
                },
            )
            .optional()
    }

    // Curriculum operations
    pub fn add_domain(&self, id: &str, name: &str, ordering: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO domains (id, name, ordering) VALUES (?1, ?2, ?3)",
            params![id, name, ordering],
        )?;
        Ok(())
    }

    pub fn add_competency(&self, id: &str, domain_id: &str, name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO competencies (id, domain_id, name) VALUES (?1, ?2, ?3)",
            params![id, domain_id, name],
        )?;
        Ok(())
    }

    pub fn add_sub_competency(
        &self,
        id: &str,
        competency_id: &str,
        name: &str,
        prerequisites: &[String],
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sub_competencies (id, competency_id, name) VALUES (?1, ?2, ?3)",
            params![id, competency_id, name],
        )?;

        for prereq in prerequisites {
            self.add_prerequisite(id, prereq)?;
        }

        Ok(())
    }

    pub fn add_prerequisite(&self, sub_competency_id: &str, prerequisite_id: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO sub_competency_prerequisites (sub_competency_id, prerequisite_id, position)
            VALUES (?1, ?2, (SELECT COALESCE(MAX(position) + 1, 0)
                             FROM sub_competency_prerequisites WHERE sub_competency_id = ?1))
            "#,
            params![sub_competency_id, prerequisite_id],
        )?;
        Ok(())
    }

    /// Load the curriculum as a domain tree.
    ///
    /// Rows whose parent is missing (possible only if foreign keys were
    /// bypassed) surface as `CurriculumIntegrity` rather than being dropped.
    pub fn list_domains(&self) -> std::result::Result<Vec<Domain>, ReportError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, ordering FROM domains ORDER BY ordering, id")?;
        let mut domains = stmt
            .query_map([], |row| {
                Ok(Domain {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    ordering: row.get(2)?,
                    competencies: vec![],
                })
            })?
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT id, domain_id, name FROM competencies ORDER BY rowid")?;
        let competencies = stmt
            .query_map([], |row| {
                Ok(Competency {
                    id: row.get(0)?,
                    domain_id: row.get(1)?,
                    name: row.get(2)?,
                    sub_competencies: vec![],
                })
            })?
            .collect::<Result<Vec<_>>>()?;

        let mut prerequisites = self.prerequisite_lists()?;

        let mut stmt = self
            .conn
            .prepare("SELECT id, competency_id, name FROM sub_competencies ORDER BY rowid")?;
        let subs = stmt
            .query_map([], |row| {
                Ok(SubCompetency {
                    id: row.get(0)?,
                    competency_id: row.get(1)?,
                    name: row.get(2)?,
                    prerequisites: vec![],
                })
            })?
            .collect::<Result<Vec<_>>>()?;

        let mut by_competency: HashMap<String, Vec<SubCompetency>> = HashMap::new();
        for mut sub in subs {
            sub.prerequisites = prerequisites.remove(&sub.id).unwrap_or_default();
            by_competency
                .entry(sub.competency_id.clone())
                .or_default()
                .push(sub);
        }

        let domain_index: HashMap<String, usize> = domains
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();

        for mut competency in competencies {
            competency.sub_competencies = by_competency.remove(&competency.id).unwrap_or_default();
            let i = *domain_index.get(&competency.domain_id).ok_or_else(|| {
                ReportError::CurriculumIntegrity(format!(
                    "competency '{}' references missing domain '{}'",
                    competency.id, competency.domain_id
                ))
            })?;
            domains[i].competencies.push(competency);
        }

        if let Some((competency_id, subs)) = by_competency.into_iter().next() {
            return Err(ReportError::CurriculumIntegrity(format!(
                "sub-competency '{}' references missing competency '{}'",
                subs.first().map(|s| s.id.as_str()).unwrap_or("?"),
                competency_id
            )));
        }

        Ok(domains)
    }

    fn prerequisite_lists(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT sub_competency_id, prerequisite_id
            FROM sub_competency_prerequisites
            ORDER BY sub_competency_id, position
            "#,
        )?;

        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut lists: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let (sub, prereq) = row?;
            lists.entry(sub).or_default().push(prereq);
        }
        Ok(lists)
    }

    // Evaluation operations
    pub fn record_attempt(
        &self,
        student_id: &str,
        sub_competency_id: &str,
        outcome: EvaluationOutcome,
        evaluator_id: &str,
        evaluated_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO evaluation_attempts (student_id, sub_competency_id, evaluated_at, outcome, evaluator_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                student_id,
                sub_competency_id,
                format_timestamp(evaluated_at),
                outcome.as_str(),
                evaluator_id
            ],
        )?;
        let attempt_id = self.conn.last_insert_rowid();

        // Back-dated attempts may not be the latest, so recompute from history
        let latest = self
            .get_attempt_history(student_id, sub_competency_id)?
            .pop()
            .ok_or(rusqlite::Error::QueryReturnedNoRows)?;

        self.conn.execute(
            r#"
            INSERT INTO student_progress (student_id, sub_competency_id, status, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(student_id, sub_competency_id)
            DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at
            "#,
            params![
                student_id,
                sub_competency_id,
                latest.outcome.implied_status().as_str(),
                format_timestamp(latest.evaluated_at)
            ],
        )?;

        Ok(attempt_id)
    }

    /// Attempts for one (student, sub-competency), oldest first; equal
    /// timestamps keep insertion order.
    pub fn get_attempt_history(
        &self,
        student_id: &str,
        sub_competency_id: &str,
    ) -> Result<Vec<EvaluationAttempt>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, student_id, sub_competency_id, evaluated_at, outcome, evaluator_id
            FROM evaluation_attempts
            WHERE student_id = ?1 AND sub_competency_id = ?2
            ORDER BY evaluated_at ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![student_id, sub_competency_id], |row| {
            let outcome: String = row.get(4)?;
            Ok(EvaluationAttempt {
                id: row.get(0)?,
                student_id: row.get(1)?,
                sub_competency_id: row.get(2)?,
                evaluated_at: parse_timestamp(3, row.get(3)?)?,
                outcome: EvaluationOutcome::from_str(&outcome)
                    .ok_or_else(|| bad_value(4, format!("unknown outcome '{}'", outcome)))?,
                evaluator_id: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    pub fn get_current_progress(&self, student_id: &str) -> Result<Vec<Progress>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT student_id, sub_competency_id, status, updated_at
            FROM student_progress
            WHERE student_id = ?1
            ORDER BY sub_competency_id
            "#,
        )?;

        let rows = stmt.query_map(params![student_id], |row| {
            let status: String = row.get(2)?;
            Ok(Progress {
                student_id: row.get(0)?,
                sub_competency_id: row.get(1)?,
                status: ProgressStatus::from_str(&status)
                    .ok_or_else(|| bad_value(2, format!("unknown status '{}'", status)))?,
                updated_at: parse_timestamp(3, row.get(3)?)?,
            })
        })?;
        rows.collect()
    }
}

// Fixed-width UTC so text ordering in SQL matches time ordering
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bad_value(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}
