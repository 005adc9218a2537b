use clap::{Parser, Subcommand};
use residuals_common::config::CpConfig;
use residuals_cp::services::repair::{RepairMode, RepairStep};
use residuals_cp::{serve, state_from_config};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "residuals-cp")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default).
    Serve,
    /// Run one step of the duplicate-MID repair.
    Repair {
        #[arg(long)]
        step: String,
        /// Write changes. Without this flag the step only reports.
        #[arg(long)]
        commit: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let config = CpConfig::from_env()?;

    let git_sha = std::env::var("GIT_SHA").ok();
    let boot_id = std::env::var("RESIDUALS_BOOT_ID")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("cp-{}", std::process::id()));
    let state = state_from_config(config, boot_id, git_sha).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state).await?,
        Command::Repair { step, commit } => {
            let step: RepairStep = step.parse()?;
            let report = state.repair().run(step, RepairMode::from_commit(commit)).await?;
            state.history.flush().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
