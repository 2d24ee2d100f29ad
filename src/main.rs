//! Virus scan agent CLI.
//!
//! Scans a request body from a file or stdin through an ICAP scanner.

use anyhow::Result;
use clap::Parser;
use sentinel_agent_virus_scan::{Config, LocalRequest, RequestVerdict, VirusScanAgent};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Virus scan agent - request body scanning over ICAP.
#[derive(Parser, Debug)]
#[command(name = "sentinel-agent-virus-scan")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Request body to scan (stdin when omitted).
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Content-Type of the request body.
    #[arg(short = 't', long)]
    content_type: Option<String>,

    /// Print example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Validate configuration and exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    if args.example_config {
        println!("{}", Config::example());
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(&args.config)?;

    if args.validate {
        info!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        config = %args.config.display(),
        scanner = %config.scanner.url,
        "Starting virus scan"
    );

    let mut request = LocalRequest::load(
        args.file.as_ref(),
        args.content_type.clone(),
        config.body.max_size,
    )
    .await?;

    let agent = VirusScanAgent::new(config)?;
    let decision = agent.on_access(&mut request).await;

    let (label, code) = match &decision.verdict {
        RequestVerdict::Forward => ("forward", 0),
        RequestVerdict::Block => ("block", 1),
        RequestVerdict::Fail { .. } => ("fail", 2),
    };
    println!(
        "{} status={} scanned={} units={}",
        label,
        request.exit_status.unwrap_or(200),
        decision.scanned,
        decision.units_scanned
    );

    Ok(ExitCode::from(code))
}
