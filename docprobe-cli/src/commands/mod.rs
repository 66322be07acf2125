//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod analyze;
mod job;

pub use job::JobCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Submit a repository for documentation analysis
    Analyze {
        /// Repository URL (https, ssh or git@)
        repository_url: String,

        /// Branch to analyze
        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Folder holding documentation; repeat for several
        #[arg(short, long = "include", default_value = "docs")]
        include_folders: Vec<String>,

        /// Project the analysis belongs to
        #[arg(long)]
        project: Option<String>,

        /// Follow the job until it finishes
        #[arg(short, long)]
        watch: bool,
    },
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Analyze {
            repository_url,
            branch,
            include_folders,
            project,
            watch,
        } => {
            analyze::handle_analyze(
                config,
                repository_url,
                branch,
                include_folders,
                project,
                watch,
            )
            .await
        }
        Commands::Job { command } => job::handle_job_command(command, config).await,
    }
}
