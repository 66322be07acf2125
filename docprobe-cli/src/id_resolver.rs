//! ID resolver module
//!
//! Handles resolution of UUID prefixes to full job ids by listing the
//! caller's jobs. This allows users to type short, unambiguous prefixes.

use anyhow::{Context, Result, anyhow};
use docprobe_client::GatewayClient;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolve a job ID or prefix to a full UUID
///
/// # Errors
/// Returns an error if no job or more than one job matches the prefix, or
/// if the listing fails.
pub async fn resolve_job_id(client: &GatewayClient, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    let prefix = match id_or_prefix {
        IdOrPrefix::Full(uuid) => return Ok(*uuid),
        IdOrPrefix::Prefix(prefix) => prefix,
    };

    let jobs = client
        .list_jobs()
        .await
        .context("Failed to fetch jobs for ID resolution")?;

    match_prefix(prefix, jobs.iter().map(|j| j.job_id))
}

fn match_prefix(prefix: &str, ids: impl Iterator<Item = Uuid>) -> Result<Uuid> {
    let matches: Vec<Uuid> = ids
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No job found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(|id| id.to_string()).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple jobs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}
