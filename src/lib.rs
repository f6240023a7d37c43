//! Student competency progress reports.
//!
//! A report compares a student's standing on every sub-competency of the
//! curriculum at the start and end of a period, applies prerequisite locking
//! and rolls the result up by competency and domain.

pub mod aggregate;
pub mod builder;
pub mod classifier;
pub mod curriculum;
pub mod db;
pub mod delta;
pub mod error;
pub mod models;
pub mod report;
pub mod store;

pub use builder::{ReportBuilder, ReportSnapshot, ReportState};
pub use curriculum::Curriculum;
pub use error::{ErrorDescriptor, ErrorKind, ReportError};
pub use models::{Report, ReportOptions, ReportPeriod, StatusKey};
pub use store::{CurriculumSource, IdentityLookup, ProgressStore, SqliteStore};
