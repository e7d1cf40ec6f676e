//! Batch runner that wires configuration, discovery, the browser, the state
//! machine and the retry scheduler together

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::browser::{Browser, BrowserDriver};
use crate::config::Config;
use crate::context::TestFileLoader;
use crate::discovery::{self, FileFilter, TEST_FILES_ENV};
use crate::error::E2eResult;
use crate::logs::LogStore;
use crate::machine::FileExecutor;
use crate::platform::{is_ci, Platform};
use crate::playwright::{PlaywrightConfig, PlaywrightDriver};
use crate::scheduler::{BatchReport, RetryScheduler, SchedulerOptions};
use crate::spec::YamlLoader;
use crate::supervisor::{LiveServers, ProcessSupervisor};

/// Configuration for the test runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory test files are searched in and named relative to
    pub root: PathBuf,
    pub filter: Option<FileFilter>,
    /// Stop at the first failing file
    pub bail: bool,
    /// Print log entries as they arrive
    pub inspect: bool,
    /// Retry passes for flaky files in CI
    pub max_retries: usize,
    pub playwright: PlaywrightConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            filter: None,
            bail: false,
            inspect: false,
            max_retries: SchedulerOptions::default().max_retries,
            playwright: PlaywrightConfig::default(),
        }
    }
}

/// Main E2E test runner
pub struct TestRunner {
    config: RunnerConfig,
    settings: Arc<Config>,
    logs: LogStore,
    loader: Arc<dyn TestFileLoader>,
    live: LiveServers,
}

impl TestRunner {
    /// Create a runner, loading `stagehand.toml` from the root upwards.
    pub fn new(config: RunnerConfig) -> E2eResult<Self> {
        let settings = Config::discover(&config.root, Platform::current(), is_ci())?;
        Ok(Self::with_settings(config, settings))
    }

    pub fn with_settings(config: RunnerConfig, settings: Config) -> Self {
        let logs = LogStore::with_platform(settings.tolerate.clone(), settings.platform);
        logs.set_flush_eagerly(config.inspect);
        let loader = Arc::new(YamlLoader::new(settings.platform, settings.ci));
        Self {
            config,
            settings: Arc::new(settings),
            logs,
            loader,
            live: LiveServers::default(),
        }
    }

    /// Replace the YAML loader, e.g. with a programmatic suite.
    pub fn with_loader(mut self, loader: Arc<dyn TestFileLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn settings(&self) -> &Config {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Server processes still owned by a monitor.
    pub fn live_servers(&self) -> &LiveServers {
        &self.live
    }

    /// After a run future was dropped, wait (at most `grace`) for the
    /// monitors to kill their process groups. `false` if some are left.
    pub async fn wait_for_servers(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.live.wait_idle()).await.is_ok()
    }

    /// Files listed in `TEST_FILES`, or found by scanning the root.
    pub fn test_files(&self) -> E2eResult<Vec<PathBuf>> {
        let explicit = std::env::var(TEST_FILES_ENV).ok().filter(|v| !v.trim().is_empty());
        if explicit.is_some() {
            debug!("Using test files from {}", TEST_FILES_ENV);
        }
        discovery::find_test_files(
            &self.config.root,
            &self.settings.test_suffixes,
            self.config.filter.as_ref(),
            explicit.as_deref(),
        )
    }

    /// Discover and run every test file with a Playwright browser.
    pub async fn run_all(&self) -> E2eResult<BatchReport> {
        let files = self.test_files()?;
        if files.is_empty() {
            warn!("No test files found under {}", self.config.root.display());
            return Ok(BatchReport::default());
        }
        let mut playwright = self.config.playwright.clone();
        playwright.cwd = self.config.root.clone();
        let driver = PlaywrightDriver::new(playwright, self.logs.clone());
        self.run_files(&driver, &files).await
    }

    /// Run `files` in order with one browser launched from `driver`.
    pub async fn run_files(&self, driver: &dyn BrowserDriver, files: &[PathBuf]) -> E2eResult<BatchReport> {
        info!("Running {} test file(s)...", files.len());
        let browser: Arc<dyn Browser> = Arc::from(driver.launch().await?);

        let supervisor = ProcessSupervisor::new(self.logs.clone()).tracking(self.live.clone());
        let executor = FileExecutor::with_supervisor(
            self.config.root.clone(),
            self.settings.clone(),
            self.logs.clone(),
            self.loader.clone(),
            browser.clone(),
            supervisor,
        );
        let scheduler = RetryScheduler::new(
            executor,
            SchedulerOptions {
                ci: self.settings.ci,
                bail: self.config.bail,
                max_retries: self.config.max_retries,
            },
        );
        let report = scheduler.run_all(files).await;

        if let Err(e) = browser.close().await {
            warn!("Failed to close the browser: {}", e);
        }
        info!(
            "Test results: {} attempt(s), {} file(s) failing",
            report.outcomes.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
