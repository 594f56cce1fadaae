// Agency binary entry point.
mod observability;

use anyhow::{Context, Result};
use clap::Parser;
use lotto_client::{CancellationToken, ClientConfig, ClientLoop, CsvSource, LoopOutcome};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "agency")]
#[command(about = "Submit an agency's bets to the central server and report its winners")]
struct Args {
    /// YAML config file layered over the LOTTO_* environment
    #[arg(long)]
    config: Option<PathBuf>,

    /// CSV file with nombre,apellido,documento,nacimiento,numero lines
    #[arg(long)]
    data: Option<PathBuf>,

    /// Central server address (host:port)
    #[arg(long)]
    server: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    observability::init_observability();
    let args = Args::parse();
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    exit_code(run(args, cancel).await)
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env_or_yaml(args.config.as_deref())?;
    if let Some(server) = &args.server {
        config.server_address = server.clone();
    }
    if let Some(data) = &args.data {
        config.data_path = Some(data.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args, cancel: CancellationToken) -> Result<LoopOutcome> {
    let config = load_config(&args)?;
    let data_path = config
        .data_path
        .clone()
        .context("no bets file: pass --data or set LOTTO_DATA_PATH")?;
    let source = CsvSource::open(config.agency_id.clone(), &data_path)
        .with_context(|| format!("open bets file {}", data_path.display()))?;
    tracing::info!(
        agency = %config.agency_id,
        server = %config.server_address,
        data = %data_path.display(),
        "agency starting"
    );
    let outcome = ClientLoop::from_config(&config, source, cancel).run().await?;
    Ok(outcome)
}

fn exit_code(result: Result<LoopOutcome>) -> ExitCode {
    match result {
        Ok(LoopOutcome::Done { winners, summary }) => {
            tracing::info!(
                winners = winners.len(),
                bets = summary.bets,
                "agency finished"
            );
            ExitCode::SUCCESS
        }
        Ok(LoopOutcome::Cancelled { during, .. }) => {
            tracing::info!(state = %during, "agency stopped by signal");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "agency failed");
            ExitCode::FAILURE
        }
    }
}

/// Fires `cancel` on Ctrl-C or SIGTERM. Later signals are no-ops.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
