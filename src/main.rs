use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use competency_report::db::Database;
use competency_report::models::{
    EvaluationOutcome, JsonOutput, ProgressDelta, ProgressStatus, Report, ReportOptions,
    ReportPeriod, StatusKey, UserRole,
};
use competency_report::{ReportBuilder, SqliteStore};

const DEFAULT_DB_NAME: &str = "competency-report.db";

#[derive(Parser)]
#[command(name = "competency-report")]
#[command(about = "Track competency evaluations and report student progress over a period")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage users
    #[command(subcommand)]
    User(UserCommands),

    /// Manage domains
    #[command(subcommand)]
    Domain(DomainCommands),

    /// Manage competencies
    #[command(subcommand)]
    Competency(CompetencyCommands),

    /// Manage sub-competencies
    #[command(subcommand)]
    Sub(SubCommands),

    /// Show the curriculum tree
    Curriculum,

    /// Record an evaluation attempt
    Evaluate {
        /// Student ID
        student: String,

        /// Sub-competency ID
        sub: String,

        /// Outcome: completed/in_progress/needs_revision/not_attempted
        #[arg(long, short)]
        outcome: String,

        /// Evaluator user ID
        #[arg(long, short)]
        evaluator: String,

        /// Evaluation time (YYYY-MM-DD or RFC 3339), defaults to now
        #[arg(long)]
        at: Option<String>,
    },

    /// Show evaluation history for one sub-competency
    History {
        /// Student ID
        student: String,

        /// Sub-competency ID
        sub: String,
    },

    /// Generate a progress report for a period
    Report {
        /// Student ID
        student: String,

        /// Period start (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        from: String,

        /// Period end, inclusive (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        to: String,

        /// Limit the report to one domain
        #[arg(long, short)]
        domain: Option<String>,

        /// Include per-sub-competency deltas
        #[arg(long)]
        details: bool,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Add a user
    Add {
        /// User ID
        id: String,

        /// Display name
        name: String,

        /// Role: student/educator/parent/admin
        #[arg(long, short, default_value = "student")]
        role: String,
    },
}

#[derive(Subcommand)]
enum DomainCommands {
    /// Add a domain
    Add {
        /// Domain ID
        id: String,

        /// Domain name
        name: String,

        /// Position in reports
        #[arg(long, short, default_value_t = 0)]
        ordering: i64,
    },
}

#[derive(Subcommand)]
enum CompetencyCommands {
    /// Add a competency to a domain
    Add {
        /// Competency ID
        id: String,

        /// Owning domain ID
        #[arg(long, short)]
        domain: String,

        /// Competency name
        name: String,
    },
}

#[derive(Subcommand)]
enum SubCommands {
    /// Add a sub-competency to a competency
    Add {
        /// Sub-competency ID
        id: String,

        /// Owning competency ID
        #[arg(long, short)]
        competency: String,

        /// Sub-competency name
        name: String,

        /// Comma-separated prerequisite sub-competency IDs
        #[arg(long, short)]
        prereq: Option<String>,
    },
}

fn get_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("COMPETENCY_REPORT_DB") {
        return PathBuf::from(path);
    }

    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("competency-report");

    std::fs::create_dir_all(&config_dir).ok();
    config_dir.join(DEFAULT_DB_NAME)
}

/// Parse `YYYY-MM-DD` or RFC 3339. A bare date resolves to the start of the
/// day, or its last microsecond when `end_of_day` is set.
fn parse_date(s: &str, end_of_day: bool) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{}'. Use YYYY-MM-DD or RFC 3339", s))?;
    let time = if end_of_day {
        date.and_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        date.and_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| format!("Invalid date '{}'", s))?;

    Ok(Utc.from_utc_datetime(&time))
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = get_db_path();
    let db = Database::open(&db_path)?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
            } else {
                println!("Database initialized at: {}", db_path.display());
            }
        }

        Commands::User(UserCommands::Add { id, name, role }) => {
            let role = UserRole::from_str(&role).ok_or_else(|| {
                format!(
                    "Invalid role '{}'. Use: student, educator, parent, or admin",
                    role
                )
            })?;
            db.add_user(&id, &name, role)?;

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                        "id": id,
                        "role": role
                    })))?
                );
            } else {
                println!("Added {} '{}' with ID: {}", role.as_str(), name, id);
            }
        }

        Commands::Domain(DomainCommands::Add { id, name, ordering }) => {
            db.add_domain(&id, &name, ordering)?;
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
            } else {
                println!("Added domain '{}' ({})", name, id);
            }
        }

        Commands::Competency(CompetencyCommands::Add { id, domain, name }) => {
            db.add_competency(&id, &domain, &name)?;
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::<()>::ok(()))?);
            } else {
                println!("Added competency '{}' ({}) to {}", name, id, domain);
            }
        }

        Commands::Sub(SubCommands::Add {
            id,
            competency,
            name,
            prereq,
        }) => {
            let prereqs = prereq.as_deref().map(split_list).unwrap_or_default();
            db.add_sub_competency(&id, &competency, &name, &prereqs)?;

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                        "id": id,
                        "prerequisites": prereqs
                    })))?
                );
            } else if prereqs.is_empty() {
                println!("Added sub-competency '{}' ({}) to {}", name, id, competency);
            } else {
                println!(
                    "Added sub-competency '{}' ({}) to {}, requires: {}",
                    name,
                    id,
                    competency,
                    prereqs.join(", ")
                );
            }
        }

        Commands::Curriculum => {
            let domains = db.list_domains()?;
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::ok(&domains))?);
            } else if domains.is_empty() {
                println!("No domains found.");
            } else {
                for domain in domains {
                    println!("{} ({})", domain.name, domain.id);
                    for competency in &domain.competencies {
                        println!("  {} ({})", competency.name, competency.id);
                        for sub in &competency.sub_competencies {
                            if sub.prerequisites.is_empty() {
                                println!("    {:<12} {}", sub.id, truncate(&sub.name, 40));
                            } else {
                                println!(
                                    "    {:<12} {:<40} requires {}",
                                    sub.id,
                                    truncate(&sub.name, 40),
                                    sub.prerequisites.join(", ")
                                );
                            }
                        }
                    }
                }
            }
        }

        Commands::Evaluate {
            student,
            sub,
            outcome,
            evaluator,
            at,
        } => {
            let eval_outcome = EvaluationOutcome::from_str(&outcome).ok_or_else(|| {
                format!(
                    "Invalid outcome '{}'. Use: completed, in_progress, needs_revision, or not_attempted",
                    outcome
                )
            })?;
            let evaluated_at = match at {
                Some(at) => parse_date(&at, false)?,
                None => Utc::now(),
            };

            let id = db.record_attempt(&student, &sub, eval_outcome, &evaluator, evaluated_at)?;

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string(&JsonOutput::ok(serde_json::json!({
                        "id": id,
                        "status": eval_outcome.implied_status()
                    })))?
                );
            } else {
                println!(
                    "Recorded {} for {} on {} (attempt {}).",
                    eval_outcome.as_str(),
                    student,
                    sub,
                    id
                );
            }
        }

        Commands::History { student, sub } => {
            let history = db.get_attempt_history(&student, &sub)?;
            if cli.json {
                println!("{}", serde_json::to_string(&JsonOutput::ok(&history))?);
            } else if history.is_empty() {
                println!("No evaluations found.");
            } else {
                println!("{:<6} {:<22} {:<16} EVALUATOR", "ID", "WHEN", "OUTCOME");
                println!("{}", "-".repeat(60));
                for attempt in history {
                    println!(
                        "{:<6} {:<22} {:<16} {}",
                        attempt.id,
                        attempt.evaluated_at.format("%Y-%m-%d %H:%M:%S"),
                        attempt.outcome.as_str(),
                        attempt.evaluator_id
                    );
                }
            }
        }

        Commands::Report {
            student,
            from,
            to,
            domain,
            details,
        } => {
            let period = ReportPeriod::new(parse_date(&from, false)?, parse_date(&to, true)?);
            let options = ReportOptions {
                domain_filter: domain,
                include_details: details,
            };

            let builder = ReportBuilder::from_store(Arc::new(SqliteStore::new(db)));
            match builder.generate_report(&student, period, options).await {
                Some(report) => {
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::ok(&report))?);
                    } else {
                        print_report(&report);
                    }
                }
                None => {
                    let message = builder
                        .error()
                        .map(|e| e.message)
                        .unwrap_or_else(|| "report generation failed".to_string());
                    if cli.json {
                        println!("{}", serde_json::to_string(&JsonOutput::<()>::err(message))?);
                    } else {
                        return Err(message.into());
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_report(report: &Report) {
    println!("=== Progress Report: {} ===", report.student_id);
    println!(
        "Period: {} to {}",
        report.period.start_date.format("%Y-%m-%d"),
        report.period.end_date.format("%Y-%m-%d")
    );
    println!();

    if report.domain_rollups.is_empty() {
        println!("No matching domains.");
        return;
    }

    println!(
        "{:<30} {:>8} {:>10} {:>8} {:>6}",
        "DOMAIN", "DONE", "COMPLETE", "NEW", "LOCKED"
    );
    println!("{}", "-".repeat(66));
    for rollup in &report.domain_rollups {
        let done = rollup.count(StatusKey::Status(ProgressStatus::Completed));
        println!(
            "{:<30} {:>8} {:>9.0}% {:>8} {:>6}",
            truncate(&rollup.domain_name, 28),
            format!("{}/{}", done, rollup.total_sub_competencies),
            rollup.completion_rate * 100.0,
            rollup.newly_acquired_count,
            rollup.count(StatusKey::Locked)
        );
        for comp in &rollup.competencies {
            println!(
                "  {:<28} {:>8} {:>9.0}% {:>8}",
                truncate(&comp.competency_name, 26),
                comp.total_sub_competencies,
                comp.completion_rate * 100.0,
                comp.newly_acquired_count
            );
        }
    }

    if let Some(deltas) = &report.flat_deltas {
        println!();
        println!("{:<16} {:<16} {:<16} CHANGE", "SUB", "BASELINE", "CURRENT");
        println!("{}", "-".repeat(60));
        for delta in deltas {
            println!(
                "{:<16} {:<16} {:<16} {}",
                truncate(&delta.sub_competency_id, 14),
                delta.baseline_status.map_or("-", |s| s.label()),
                delta.current_status.label(),
                change_marker(delta)
            );
        }
    }
}

fn change_marker(delta: &ProgressDelta) -> &'static str {
    if delta.newly_acquired {
        "acquired"
    } else if delta.changed {
        "changed"
    } else {
        ""
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
