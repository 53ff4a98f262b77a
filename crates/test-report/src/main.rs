// crates/test-report/src/main.rs

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pds_test_report::{summarize, Source};
use tracing::info;

/// Builds a JSON summary and a JUnit report from `go test -json` output.
#[derive(Parser, Debug)]
#[command(name = "pds-test-report", version)]
struct Cli {
    /// Files, directories, http(s) URLs or zip archives holding test events.
    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<String>,

    /// Write the JSON summary here. Printed to stdout when no output is given.
    #[arg(long)]
    json: Option<PathBuf>,

    /// Write a JUnit XML report here.
    #[arg(long)]
    junit: Option<PathBuf>,

    /// Name of the JUnit report.
    #[arg(long, default_value = "PDS integration tests")]
    name: String,

    /// Exit non-zero when a test failed or never finished.
    #[arg(long)]
    fail_on_failure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sources: Vec<Source> = cli.inputs.iter().map(|i| Source::parse(i)).collect();
    let summary = summarize(&reqwest::Client::new(), &sources).await?;
    info!(
        tests = summary.totals.tests,
        passed = summary.totals.passed,
        failed = summary.totals.failed,
        skipped = summary.totals.skipped,
        unknown = summary.totals.unknown,
        "aggregated test results"
    );

    if let Some(path) = &cli.junit {
        std::fs::write(path, summary.to_junit(&cli.name)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("JUnit report written to {}", path.display());
    }
    match &cli.json {
        Some(path) => {
            std::fs::write(path, summary.to_json()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("JSON summary written to {}", path.display());
        }
        None if cli.junit.is_none() => println!("{}", summary.to_json()?),
        None => {}
    }

    if cli.fail_on_failure && summary.has_failures() {
        anyhow::bail!("test run has failures");
    }
    Ok(())
}
