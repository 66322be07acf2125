//! Job command handlers
//!
//! Handles listing jobs, viewing status and use case results, downloading
//! job files, cancelling, and watching a job until it settles.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use docprobe_client::GatewayClient;
use docprobe_core::domain::job::{JobPhase, UseCaseCounts};
use docprobe_core::domain::report::QualityReport;
use docprobe_core::domain::use_case::{UseCaseRecord, UseCaseStatus};
use docprobe_core::dto::job::{JobStatusView, JobSummary};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::id_resolver::resolve_job_id;
use crate::types::IdOrPrefix;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// List your jobs
    List {
        /// Only jobs submitted under this project
        #[arg(short, long)]
        project: Option<String>,
    },
    /// Get job status
    Get {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Show one use case of a job, including its log and result
    UseCase {
        /// Job ID or unambiguous prefix
        id: String,

        /// Use case index
        index: u32,
    },
    /// Download a file written by the job, e.g. report.json
    File {
        /// Job ID or unambiguous prefix
        id: String,

        /// Path relative to the job's data directory
        path: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Request cancellation of a job
    Cancel {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Poll a job until it reaches a terminal phase
    Watch {
        /// Job ID or unambiguous prefix
        id: String,

        /// Seconds between polls
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
    },
}

/// Handle job commands
///
/// Routes job subcommands to their respective handlers.
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        JobCommands::List { project } => list_jobs(&client, project.as_deref()).await,
        JobCommands::Get { id } => get_job(&client, &id).await,
        JobCommands::UseCase { id, index } => get_use_case(&client, &id, index).await,
        JobCommands::File { id, path, output } => {
            get_job_file(&client, &id, &path, output).await
        }
        JobCommands::Cancel { id } => cancel_job(&client, &id).await,
        JobCommands::Watch { id, interval } => {
            let uuid = resolve_job_id(&client, &IdOrPrefix::parse(&id)).await?;
            watch_job(&client, uuid, Duration::from_secs(interval.max(1))).await
        }
    }
}

async fn list_jobs(client: &GatewayClient, project: Option<&str>) -> Result<()> {
    let jobs = match project {
        Some(project) => client.list_jobs_in_project(project).await?,
        None => client.list_jobs().await?,
    };

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

async fn get_job(client: &GatewayClient, id: &str) -> Result<()> {
    let uuid = resolve_job_id(client, &IdOrPrefix::parse(id)).await?;
    let job = client.get_job(uuid).await?;

    print_job_details(&job);

    Ok(())
}

async fn get_use_case(client: &GatewayClient, id: &str, index: u32) -> Result<()> {
    let uuid = resolve_job_id(client, &IdOrPrefix::parse(id)).await?;
    let record = client.get_use_case(uuid, index).await?;

    print_use_case_details(&record);

    Ok(())
}

async fn get_job_file(
    client: &GatewayClient,
    id: &str,
    path: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let uuid = resolve_job_id(client, &IdOrPrefix::parse(id)).await?;
    let contents = client.get_job_file(uuid, path).await?;

    match output {
        Some(output) => {
            tokio::fs::write(&output, &contents)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "{} {} ({} bytes)",
                "✓ Saved".green().bold(),
                output.display(),
                contents.len()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&contents)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

async fn cancel_job(client: &GatewayClient, id: &str) -> Result<()> {
    let uuid = resolve_job_id(client, &IdOrPrefix::parse(id)).await?;
    let response = client.cancel_job(uuid).await?;

    if response.cancel_requested {
        println!("{}", "✓ Cancellation requested".green().bold());
    } else {
        println!("{}", "⚠ Cancellation already pending".yellow());
    }
    println!("  Job ID: {}", response.job_id.to_string().cyan());
    println!("  Phase:  {}", colorize_phase(response.phase));

    Ok(())
}

/// Polls the job until it is terminal, printing each phase or count change
pub async fn watch_job(client: &GatewayClient, job_id: Uuid, interval: Duration) -> Result<()> {
    let mut last: Option<(JobPhase, UseCaseCounts)> = None;

    loop {
        let job = client.get_job(job_id).await?;

        if last != Some((job.phase, job.counts)) {
            println!(
                "{} {}  {}",
                job.updated_at.format("%H:%M:%S").to_string().dimmed(),
                colorize_phase(job.phase),
                format_counts(&job.counts)
            );
            last = Some((job.phase, job.counts));
        }

        if job.phase.is_terminal() {
            println!();
            print_job_details(&job);
            return Ok(());
        }

        tokio::time::sleep(interval).await;
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_job_summary(job: &JobSummary) {
    println!("  {} Job {}", "▸".cyan(), job.job_id.to_string().dimmed());
    println!("    Repository: {} ({})", job.repository_url, job.branch);
    if let Some(project) = &job.project_id {
        println!("    Project:    {}", project);
    }
    println!("    Phase:      {}", colorize_phase(job.phase));
    if job.counts.total > 0 {
        println!("    Use cases:  {}", format_counts(&job.counts));
    }
    println!(
        "    Created:    {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_job_details(job: &JobStatusView) {
    println!("{}", "Job Details:".bold());
    println!("  ID:         {}", job.job_id.to_string().cyan());
    println!("  Repository: {}", job.repository_url);
    println!("  Branch:     {}", job.branch);
    println!("  Phase:      {}", colorize_phase(job.phase));
    println!("  Created:    {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:    {}", job.updated_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(message) = &job.message {
        println!("  Message:    {}", message.dimmed());
    }

    if let Some(error) = &job.error {
        println!("\n{}", "Error:".bold());
        println!("  [{}] {}", error.kind, error.message.red());
    }

    if !job.use_cases.is_empty() {
        println!("\n{} {}", "Use Cases:".bold(), format_counts(&job.counts));
        for record in job.use_cases.values() {
            let duration = record
                .duration_seconds
                .map(|d| format!("{:.1}s", d))
                .unwrap_or_default();
            println!(
                "  {:>3}  {:<10} {:>8}  {}",
                record.index,
                colorize_use_case_status(record.status),
                duration.dimmed(),
                record.use_case.name
            );
        }
    }

    if let Some(report) = &job.report {
        print_report(report);
    }
}

fn print_use_case_details(record: &UseCaseRecord) {
    println!("{}", "Use Case:".bold());
    println!("  Index:      {}", record.index);
    println!("  Name:       {}", record.use_case.name.cyan());
    println!("  Difficulty: {}", record.use_case.difficulty);
    println!("  Status:     {}", colorize_use_case_status(record.status));

    if let Some(code) = record.exit_code {
        println!("  Exit Code:  {}", code);
    }
    if let Some(duration) = record.duration_seconds {
        println!("  Duration:   {:.1}s", duration);
    }

    if !record.use_case.description.is_empty() {
        println!("\n{}", "Description:".bold());
        println!("  {}", record.use_case.description);
    }

    if !record.use_case.success_criteria.is_empty() {
        println!("\n{}", "Success Criteria:".bold());
        for criterion in &record.use_case.success_criteria {
            println!("  - {}", criterion);
        }
    }

    if let Some(error) = &record.error {
        println!("\n{}", "Error:".bold());
        println!("  [{}] {}", error.kind, error.message.red());
    }

    if let Some(result) = &record.result {
        println!("\n{}", "Result:".bold());
        match serde_json::to_string_pretty(result) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{:?}", result),
        }
    }

    if let Some(log) = &record.log {
        println!("\n{}", "Log:".bold());
        println!("{}", "─".repeat(80).dimmed());
        println!("{}", log);
        println!("{}", "─".repeat(80).dimmed());
    }
}

fn print_report(report: &QualityReport) {
    println!("\n{}", "Quality Report:".bold());
    println!(
        "  Grade:        {}  (score {:.1})",
        report.grade.to_string().bold(),
        report.quality_score
    );
    println!(
        "  Success rate: {:.0}% ({}/{})",
        report.success_rate * 100.0,
        report.successful_executions,
        report.total_use_cases
    );

    for issue in &report.issues {
        println!("  {} {}", "✗".red(), issue);
    }
    for recommendation in &report.recommendations {
        println!("  {} {}", "→".cyan(), recommendation);
    }
}

fn format_counts(counts: &UseCaseCounts) -> String {
    format!(
        "{} total, {} pending, {} running, {} completed, {} failed",
        counts.total, counts.pending, counts.running, counts.completed, counts.failed
    )
}

/// Colorize job phase for display
fn colorize_phase(phase: JobPhase) -> ColoredString {
    let phase_str = phase.to_string();
    match phase {
        JobPhase::Pending | JobPhase::Queued => phase_str.yellow(),
        JobPhase::Cloning | JobPhase::Extracting | JobPhase::Executing => phase_str.cyan(),
        JobPhase::Completed | JobPhase::NoUseCases => phase_str.green(),
        JobPhase::CompletedWithErrors => phase_str.yellow(),
        JobPhase::Failed | JobPhase::ExtractionFailed => phase_str.red(),
        JobPhase::Cancelled => phase_str.dimmed(),
    }
}

fn colorize_use_case_status(status: UseCaseStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        UseCaseStatus::Pending => status_str.yellow(),
        UseCaseStatus::Running => status_str.cyan(),
        UseCaseStatus::Completed => status_str.green(),
        UseCaseStatus::Failed => status_str.red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_counts() {
        let counts = UseCaseCounts {
            total: 7,
            pending: 2,
            running: 3,
            completed: 1,
            failed: 1,
        };
        assert_eq!(
            format_counts(&counts),
            "7 total, 2 pending, 3 running, 1 completed, 1 failed"
        );
    }
}
