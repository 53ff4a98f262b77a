// crates/integration-tests/src/main.rs

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pds_harness::{HarnessConfig, Suite};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod scenarios;
mod summary;

use summary::{RunSummary, ScenarioStatus};

/// Runs the PDS end-to-end scenarios against a control plane and a target
/// cluster.
#[derive(Parser, Debug)]
#[command(name = "pds-integration-tests", version)]
struct Cli {
    #[command(flatten)]
    config: HarnessConfig,

    /// Print the scenario names and exit.
    #[arg(long)]
    list: bool,

    /// Run only these scenarios (repeatable). Default: all.
    #[arg(long = "scenario", value_name = "NAME")]
    scenarios: Vec<String>,

    /// Remove the deployment target and the agent after the scenarios.
    #[arg(long, env = "PDS_DEREGISTER_TARGET")]
    deregister: bool,

    /// Write a JSON summary of the run here.
    #[arg(long, env = "PDS_SUMMARY_FILE")]
    summary: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("hyper=warn".parse()?)
                .add_directive("h2=warn".parse()?)
                .add_directive("rustls=warn".parse()?)
                .add_directive("aws_smithy_runtime=warn".parse()?),
        )
        .init();

    pds_harness::install_crypto_provider()?;

    let mut cli = Cli::parse();
    if cli.list {
        for def in scenarios::ALL {
            println!("{:<40} {}", def.name, def.description);
        }
        return Ok(());
    }
    let selected = scenarios::select(&cli.scenarios)?;
    cli.config
        .load_secrets()
        .context("Failed to load secrets from the environment")?;

    info!("Starting PDS Integration Tests");
    info!("==============================");

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling running scenario");
            interrupt.cancel();
        }
    });

    info!("\n=== Setup ===");
    let mut suite = Suite::setup(cli.config, ctx.clone())
        .await
        .context("Failed to set up the suite")?;
    info!("Deployment target: {}", suite.target().deployment_target_id);
    info!("Test namespace: {}", suite.target().namespace);

    let mut run = RunSummary::start();
    for def in &selected {
        info!("\n=== Scenario: {} ===", def.name);
        if ctx.is_cancelled() {
            run.record_skipped(def.name, "run cancelled");
            continue;
        }
        if let Some(reason) = scenarios::skip_reason(&suite, def) {
            warn!("Skipping {}: {}", def.name, reason);
            run.record_skipped(def.name, reason);
            continue;
        }
        let outcome = scenarios::run(&suite, def).await;
        run.record(&outcome);
    }

    if cli.deregister {
        info!("\n=== Deregister ===");
        if let Err(e) = suite.deregister_target().await {
            error!("Deregistration failed: {}", e);
            run.record_failure("deregister", &e.to_string());
        }
    }

    // Cleanup
    info!("\n=== Teardown ===");
    let teardown = suite.teardown().await;
    if let Err(e) = teardown.into_result() {
        error!("Teardown failed: {}", e);
        run.record_failure("teardown", &e.to_string());
    }

    let run = run.finish();
    if let Some(path) = &cli.summary {
        run.write(path)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }

    // Summary
    info!("\n=== Test Summary ===");
    for scenario in &run.scenarios {
        match scenario.status {
            ScenarioStatus::Passed => {
                info!("  ✅ {} ({:.1}s)", scenario.name, scenario.elapsed_seconds)
            }
            ScenarioStatus::Skipped => info!("  ⏭  {} (skipped)", scenario.name),
            ScenarioStatus::Failed => error!("  ❌ {}", scenario.name),
        }
    }
    let failures = run.failed();
    if failures.is_empty() {
        info!("✅ All scenarios passed!");
        Ok(())
    } else {
        error!("❌ Failed scenarios:");
        for failure in failures {
            let reason = failure.error.as_deref().unwrap_or("cleanup failed");
            error!("  - {}: {}", failure.name, reason);
        }
        anyhow::bail!("Integration tests failed")
    }
}
