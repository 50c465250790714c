mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use mirror_harness::config::HarnessConfig;
use mirror_harness::cycle::CycleRunner;

fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,mirror_harness=debug,mirror_agent=debug")
            }),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!("Testing agent failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = HarnessConfig::load(cli.config.as_deref())?;
    cli.apply_to(&mut config);

    if cli.print_config {
        print!("{}", config.redacted().to_toml_string()?);
        return Ok(());
    }

    config.validate().context("Invalid configuration")?;
    tracing::info!("Mirror of Truth testing agent starting...");
    tracing::debug!("Effective config: {:?}", config.redacted());

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let report = runtime.block_on(async {
        let runner = CycleRunner::from_config(config, cli.skip_provision)?;
        let mut logger = runner.open_session_log()?;
        runner.run(&mut logger).await
    })?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report.summary).context("Failed to encode summary")?
        );
    } else {
        print!("{}", report.summary.render());
    }

    tracing::info!("Summary written to {:?}", report.summary_path);
    Ok(())
}
