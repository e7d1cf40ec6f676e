//! Stagehand CLI - Main Entry Point
//!
//! Discovers end-to-end test files and runs them one at a time, exiting with
//! status 1 when any of them still fails.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use stagehand_e2e::discovery::FileFilter;
use stagehand_e2e::playwright::{BrowserKind, PlaywrightConfig};
use stagehand_e2e::{BatchReport, RunnerConfig, TestRunner};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod output;

/// Set to any non-empty value to print log entries as they arrive.
const INSPECT_ENV: &str = "TEST_INSPECT";

/// How long an interrupted run waits for server process groups to be killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stagehand - end-to-end test runner
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Only run test files whose path contains every pattern
    patterns: Vec<String>,

    /// Run the test files matching none of the patterns instead
    #[arg(long)]
    exclude: bool,

    /// Print logs as they arrive instead of only on failure
    #[arg(long)]
    debug: bool,

    /// Stop at the first failing test file
    #[arg(long)]
    bail: bool,

    /// Enable verbose runner diagnostics
    #[arg(short, long)]
    verbose: bool,

    /// Directory to search for test files
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Browser to run the tests in
    #[arg(long, value_enum, default_value = "chromium")]
    browser: BrowserArg,

    /// Show the browser window
    #[arg(long)]
    headed: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum BrowserArg {
    Chromium,
    Firefox,
    Webkit,
}

impl From<BrowserArg> for BrowserKind {
    fn from(arg: BrowserArg) -> Self {
        match arg {
            BrowserArg::Chromium => BrowserKind::Chromium,
            BrowserArg::Firefox => BrowserKind::Firefox,
            BrowserArg::Webkit => BrowserKind::Webkit,
        }
    }
}

fn inspect_from_env() -> bool {
    std::env::var_os(INSPECT_ENV).map_or(false, |v| !v.is_empty())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli).await {
        Ok(Some(report)) if report.is_success() => ExitCode::SUCCESS,
        // Interrupted
        Ok(None) => ExitCode::FAILURE,
        Ok(Some(report)) => {
            output::print_failed(&report.failed);
            ExitCode::FAILURE
        }
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

/// `None` when interrupted with Ctrl-C.
async fn run(cli: Cli) -> anyhow::Result<Option<BatchReport>> {
    let config = RunnerConfig {
        root: cli.root,
        filter: FileFilter::new(cli.patterns, cli.exclude),
        bail: cli.bail,
        inspect: cli.debug || inspect_from_env(),
        playwright: PlaywrightConfig {
            browser: cli.browser.into(),
            headless: !cli.headed,
            ..PlaywrightConfig::default()
        },
        ..RunnerConfig::default()
    };
    let runner = TestRunner::new(config)?;
    debug!(config = ?runner.settings().path, ci = runner.settings().ci, "Runner configured");

    tokio::select! {
        report = runner.run_all() => return Ok(Some(report?)),
        _ = tokio::signal::ctrl_c() => {}
    }

    // The run future is gone; its dropped server handles make the monitors
    // kill their process groups.
    if !runner.wait_for_servers(SHUTDOWN_GRACE).await {
        warn!(
            servers = runner.live_servers().count(),
            "Server processes still running after {:?}", SHUTDOWN_GRACE
        );
    }
    runner.logs().flush();
    output::print_error("Interrupted");
    Ok(None)
}
