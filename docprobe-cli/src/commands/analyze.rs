//! Analysis submission

use anyhow::{Result, anyhow};
use colored::*;
use docprobe_core::dto::job::SubmitAnalysis;
use std::time::Duration;

use crate::commands::job::watch_job;
use crate::config::Config;

pub async fn handle_analyze(
    config: &Config,
    repository_url: String,
    branch: String,
    include_folders: Vec<String>,
    project_id: Option<String>,
    watch: bool,
) -> Result<()> {
    let request = SubmitAnalysis {
        repository_url,
        branch,
        include_folders,
        project_id,
    };
    request.validate().map_err(|e| anyhow!(e))?;

    let client = config.client();
    let response = client.submit_analysis(&request).await?;

    println!("{}", "✓ Analysis submitted".green().bold());
    println!("  Job ID:  {}", response.job_id.to_string().cyan());
    println!("  Phase:   {}", response.phase);
    println!("  {}", response.message.dimmed());

    if watch {
        println!();
        watch_job(&client, response.job_id, Duration::from_secs(5)).await?;
    }

    Ok(())
}
