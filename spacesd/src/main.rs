use spacesd::daemon::{DaemonConfig, DaemonRuntime, sweep_only};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Sweep,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--sweep" => mode = CliMode::Sweep,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,notify=warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: spacesd [--sweep]");
        println!("  --sweep   Remove leftover transfer temp files from both trees and exit");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    if mode == CliMode::Sweep {
        let removed = sweep_only(&config).await?;
        tracing::info!(files = removed, "sweep finished");
        return Ok(());
    }
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
