//! Test file state machine
//!
//! Drives one file through `Loading → Skipped | AwaitingRun → Booting →
//! RunningSteps → Terminating → Passed | Failed`, turning supervisor and log
//! store signals into a verdict.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser::{Browser, BrowserPage};
use crate::config::{Config, Timeouts};
use crate::context::{CurrentRun, Phase, RunParameters, RunSlot, StepContext, TestFileLoader};
use crate::edit::FileEditor;
use crate::error::{E2eError, E2eResult};
use crate::logs::{LogSource, LogStore};
use crate::platform::humanize_time;
use crate::scheduler::RunFile;
use crate::status::{self, Progress};
use crate::supervisor::{LaunchSpec, ProcessSupervisor, ServerHandle};

/// Why a file failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    ServerStart(String),
    Browser(String),
    StepThrew {
        index: usize,
        description: String,
        error: String,
    },
    StepFailingLogs {
        index: usize,
        description: String,
    },
    Termination,
    Usage(String),
    Bug(String),
}

impl FailureReason {
    pub fn summary(&self) -> String {
        match self {
            FailureReason::ServerStart(_) => "server start failure".into(),
            FailureReason::Browser(_) => "browser failure".into(),
            FailureReason::StepThrew { index, description, .. } => {
                format!("test #{} `{}` threw an error", index + 1, description)
            }
            FailureReason::StepFailingLogs { index, description } => {
                format!("test #{} `{}` produced failing logs", index + 1, description)
            }
            FailureReason::Termination => "termination produced failing logs".into(),
            FailureReason::Usage(_) => "wrong usage of the test API".into(),
            FailureReason::Bug(_) => "a bug occurred in the test runner".into(),
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            FailureReason::ServerStart(e)
            | FailureReason::Browser(e)
            | FailureReason::Usage(e)
            | FailureReason::Bug(e)
            | FailureReason::StepThrew { error: e, .. } => Some(e),
            FailureReason::StepFailingLogs { .. } | FailureReason::Termination => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {}", self.summary(), detail),
            None => f.write_str(&self.summary()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(FailureReason),
    Skipped(String),
}

impl Verdict {
    /// Skipped files count as passing.
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Failed(_))
    }
}

/// Result of running one file once.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub verdict: Verdict,
    /// The file allows retries
    pub flaky: bool,
    pub duration: Duration,
}

impl FileOutcome {
    pub fn is_failure(&self) -> bool {
        self.verdict.is_failure()
    }

    pub fn is_usage_failure(&self) -> bool {
        matches!(self.verdict, Verdict::Failed(FailureReason::Usage(_)))
    }
}

/// Runs test files one at a time against a shared browser.
pub struct FileExecutor {
    root: PathBuf,
    config: Arc<Config>,
    logs: LogStore,
    loader: Arc<dyn TestFileLoader>,
    browser: Arc<dyn Browser>,
    supervisor: ProcessSupervisor,
    slot: RunSlot,
}

impl FileExecutor {
    pub fn new(
        root: impl Into<PathBuf>,
        config: Arc<Config>,
        logs: LogStore,
        loader: Arc<dyn TestFileLoader>,
        browser: Arc<dyn Browser>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(logs.clone());
        Self::with_supervisor(root, config, logs, loader, browser, supervisor)
    }

    pub fn with_supervisor(
        root: impl Into<PathBuf>,
        config: Arc<Config>,
        logs: LogStore,
        loader: Arc<dyn TestFileLoader>,
        browser: Arc<dyn Browser>,
        supervisor: ProcessSupervisor,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            logs,
            loader,
            browser,
            supervisor,
            slot: RunSlot::new(),
        }
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    /// Run one file; the verdict banner is final unless the file is flaky and
    /// more attempts follow.
    pub async fn run_file(&self, path: &Path, is_final_attempt: bool) -> FileOutcome {
        let started = Instant::now();
        info!(file = %path.display(), is_final_attempt, "Running test file");

        let mut run = match self.slot.acquire(path, &self.root) {
            Ok(run) => run,
            Err(e) => {
                status::log_error(&e, "BUG");
                return FileOutcome {
                    path: path.to_path_buf(),
                    verdict: Verdict::Failed(FailureReason::Bug(e.to_string())),
                    flaky: false,
                    duration: started.elapsed(),
                };
            }
        };

        self.logs.clear();
        self.logs.set_label(run.test_name(), None);

        let verdict = match self.drive(&mut run).await {
            Ok(verdict) => verdict,
            Err(e) if e.is_bug() => {
                self.report_bug(&run, &e);
                Verdict::Failed(FailureReason::Bug(e.to_string()))
            }
            Err(e) => {
                // The file could not be loaded
                status::log_fail(run.file_path(), &FailureReason::Usage(String::new()).summary());
                status::log_error(&e, "ERROR");
                self.logs.flush();
                Verdict::Failed(FailureReason::Usage(e.to_string()))
            }
        };

        if verdict.is_failure() {
            if let Err(e) = run.advance(Phase::Failed) {
                debug!("{}", e);
            }
        }

        let flaky = run.parameters().map_or(false, |p| p.flaky);
        let outcome = FileOutcome {
            path: path.to_path_buf(),
            verdict,
            flaky,
            duration: started.elapsed(),
        };

        match &outcome.verdict {
            Verdict::Passed => {
                status::log_pass(run.file_path());
                self.logs.clear();
            }
            Verdict::Skipped(reason) => status::log_warn(run.file_path(), reason),
            Verdict::Failed(FailureReason::Bug(_) | FailureReason::Usage(_)) => {}
            Verdict::Failed(reason) => self.report_failure(&run, reason, is_final_attempt || !flaky),
        }
        info!(
            file = %path.display(),
            duration = %humanize_time(outcome.duration),
            failed = outcome.is_failure(),
            "Test file finished"
        );
        outcome
    }

    /// `Err` only for usage errors and bugs; test failures are verdicts.
    async fn drive(&self, run: &mut CurrentRun) -> E2eResult<Verdict> {
        let path = run.file_path().to_path_buf();
        self.loader.load(&path, run)?;
        if run.finish_loading()? == Phase::Skipped {
            let reason = run.skipped_reason().unwrap_or_default().to_string();
            return Ok(Verdict::Skipped(reason));
        }

        let params = run
            .parameters()
            .cloned()
            .ok_or_else(|| E2eError::bug("run awaiting boot without parameters"))?;
        let timeouts = params.effective_timeouts(&self.config.timeouts);
        self.logs.set_label(run.test_name(), Some(params.cmd.clone()));

        run.advance(Phase::Booting)?;
        let page: Arc<dyn BrowserPage> = match self.browser.new_page().await {
            Ok(page) => Arc::from(page),
            Err(e) => {
                self.logs.add(LogSource::RunFailure, e.to_string());
                return Ok(Verdict::Failed(FailureReason::Browser(e.to_string())));
            }
        };
        run.set_page(page.clone());
        let forwarder = self.forward_page_events(page.as_ref());
        if let Err(e) = page.set_default_timeout(timeouts.browser).await {
            warn!("Could not set the browser default timeout: {}", e);
        }

        let server = match self.boot(run.test_dir(), &params, &timeouts).await {
            Ok(server) => server,
            Err(e) if e.is_bug() => return Err(e),
            Err(e) => {
                self.logs.add(LogSource::RunFailure, e.to_string());
                self.close_page(run, forwarder).await;
                return Ok(Verdict::Failed(FailureReason::ServerStart(e.to_string())));
            }
        };

        run.advance(Phase::RunningSteps)?;
        if let Some(reason) = self.run_steps(run, &params, &timeouts, page).await? {
            self.logs
                .add(LogSource::RunEvent, "Terminate server.");
            self.close_page(run, forwarder).await;
            server.terminate(false).await;
            return Ok(Verdict::Failed(reason));
        }

        run.advance(Phase::Terminating)?;
        self.logs.add(LogSource::RunEvent, "Terminate server.");
        self.close_page(run, forwarder).await;
        server.terminate(false).await;
        if self.logs.has_fail_logs(true) {
            return Ok(Verdict::Failed(FailureReason::Termination));
        }

        run.advance(Phase::Passed)?;
        Ok(Verdict::Passed)
    }

    async fn boot(
        &self,
        test_dir: PathBuf,
        params: &RunParameters,
        timeouts: &Timeouts,
    ) -> E2eResult<ServerHandle> {
        let kill_port = if !self.config.ci && self.config.platform.is_linux() {
            params.port()
        } else {
            None
        };
        let spec = LaunchSpec {
            cmd: params.cmd.clone(),
            cwd: params.cwd.clone().unwrap_or(test_dir),
            ready: params.ready_predicate(),
            ready_timeout: timeouts.server_ready,
            ready_delay: params.ready_delay,
            termination_timeout: timeouts.termination,
            kill_port,
        };

        let mut progress = Progress::start(format!("[run] {}", params.cmd));
        let mut server = self.supervisor.start(spec).await?;
        let ready = server.wait_ready().await;
        progress.finish(ready.is_err());
        ready?;
        Ok(server)
    }

    /// Returns the failure that stopped the steps, if any.
    async fn run_steps(
        &self,
        run: &mut CurrentRun,
        params: &RunParameters,
        timeouts: &Timeouts,
        page: Arc<dyn BrowserPage>,
    ) -> E2eResult<Option<FailureReason>> {
        let test_dir = run.test_dir();
        let files = FileEditor::new(&test_dir);

        for (index, step) in run.take_steps().into_iter().enumerate() {
            let description = step.description;
            self.logs
                .add(LogSource::TestEvent, format!("Run test `{}`", description));
            let mut progress = Progress::start(format!("[test] {}", description));

            let ctx = StepContext::new(
                page.clone(),
                self.logs.clone(),
                files.clone(),
                params.server_url.clone(),
                &test_dir,
                *timeouts,
            )
            .cwd(params.cwd.clone().unwrap_or_else(|| test_dir.clone()));
            let mut result = match tokio::time::timeout(timeouts.step, (step.thunk)(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(E2eError::StepTimeout(humanize_time(timeouts.step)).into()),
            };

            let step_failed = result.is_err();
            if let Err(e) = files.after_step(step_failed) {
                if !step_failed {
                    result = Err(e.into());
                }
            }
            progress.finish(result.is_err());

            if let Err(e) = result {
                if let Some(bug) = e.downcast_ref::<E2eError>().filter(|e| e.is_bug()) {
                    return Err(E2eError::bug(bug.to_string()));
                }
                return Ok(Some(FailureReason::StepThrew {
                    index,
                    description,
                    error: format!("{:#}", e),
                }));
            }
            if self.logs.has_fail_logs(params.fail_on_warning) {
                return Ok(Some(FailureReason::StepFailingLogs { index, description }));
            }
            self.logs.clear();
        }
        Ok(None)
    }

    /// Deliver page console/error events to the log store until the page closes.
    fn forward_page_events(&self, page: &dyn BrowserPage) -> Option<JoinHandle<()>> {
        let mut events = page.take_events()?;
        let logs = self.logs.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                logs.add(event.log_source(), event.render());
            }
        }))
    }

    async fn close_page(&self, run: &mut CurrentRun, forwarder: Option<JoinHandle<()>>) {
        if let Some(page) = run.take_page() {
            if let Err(e) = page.close().await {
                warn!("Failed to close page: {}", e);
            }
        }
        if let Some(mut forwarder) = forwarder {
            if tokio::time::timeout(Duration::from_secs(1), &mut forwarder)
                .await
                .is_err()
            {
                forwarder.abort();
            }
        }
    }

    fn report_failure(&self, run: &CurrentRun, reason: &FailureReason, is_final: bool) {
        if is_final {
            status::log_fail(run.file_path(), &reason.summary());
        } else {
            status::log_will_retry(run.file_path(), &reason.summary());
        }
        if let Some(detail) = reason.detail() {
            status::log_error(&detail, "ERROR");
        }
        let include_warnings = match reason {
            FailureReason::StepThrew { .. } | FailureReason::StepFailingLogs { .. } => {
                run.parameters().map_or(true, |p| p.fail_on_warning)
            }
            _ => true,
        };
        self.logs.log_errors(include_warnings);
        status::log_section("ALL LOGS");
        self.logs.flush();
    }

    fn report_bug(&self, run: &CurrentRun, err: &E2eError) {
        status::log_fail(run.file_path(), &FailureReason::Bug(String::new()).summary());
        status::log_error(err, "BUG");
        let info = format!("{}\nplatform: {}", run.debug_info(), self.config.platform);
        status::log_error(&info, "DEBUG INFO");
        self.logs.log_errors(true);
        status::log_section("ALL LOGS");
        self.logs.flush();
    }
}

#[async_trait]
impl RunFile for FileExecutor {
    async fn run_file(&self, path: &Path, is_final_attempt: bool) -> FileOutcome {
        FileExecutor::run_file(self, path, is_final_attempt).await
    }
}
