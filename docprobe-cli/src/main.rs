//! Docprobe CLI
//!
//! Command-line interface for submitting repositories to the Docprobe
//! gateway and following their analysis jobs.

mod commands;
mod config;
mod id_resolver;
mod types;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "docprobe")]
#[command(about = "Documentation quality analysis CLI", long_about = None)]
struct Cli {
    /// Gateway URL
    #[arg(
        long,
        env = "DOCPROBE_GATEWAY_URL",
        default_value = "http://localhost:8080"
    )]
    gateway_url: String,

    /// User the jobs are submitted and listed for
    #[arg(long, env = "DOCPROBE_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        gateway_url: cli.gateway_url,
        user_id: cli.user,
    };

    handle_command(cli.command, &config).await
}
