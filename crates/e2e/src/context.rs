//! Per-file test run context: registration API, phases and the step context
//!
//! A test file is loaded into a [`TestFileRun`] by a [`TestFileLoader`]: it
//! either skips itself or configures a server run and registers steps. Only one
//! run exists at a time; [`RunSlot`] hands out the [`CurrentRun`] and refuses a
//! second one until the first is dropped.

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::debug;

use crate::browser::BrowserPage;
use crate::config::Timeouts;
use crate::edit::FileEditor;
use crate::error::{ensure_invariant, ensure_usage, E2eError, E2eResult};
use crate::logs::{LogEntry, LogSource, LogStore};
use crate::platform::humanize_time;
use crate::supervisor::{port_of, shell_command, ReadyPredicate};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";

/// Where a test file is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Loading,
    Skipped,
    AwaitingRun,
    Booting,
    RunningSteps,
    Terminating,
    Passed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Skipped | Phase::Passed | Phase::Failed)
    }

    fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Loading, Skipped | AwaitingRun) => true,
            (AwaitingRun, Booting) => true,
            (Booting, RunningSteps) => true,
            (RunningSteps, Terminating) => true,
            (Terminating, Passed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How to start and judge the server of one test file.
#[derive(Debug, Clone)]
pub struct RunParameters {
    pub cmd: String,
    /// Defaults to the test file's directory
    pub cwd: Option<PathBuf>,
    pub server_url: String,
    /// `None` falls back to the well-known dev-server banners
    pub ready: Option<ReadyPredicate>,
    pub ready_delay: Duration,
    pub additional_timeout: Duration,
    /// Overrides the configured per-step timeout
    pub step_timeout: Option<Duration>,
    pub fail_on_warning: bool,
    pub flaky: bool,
}

impl RunParameters {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: None,
            server_url: DEFAULT_SERVER_URL.to_string(),
            ready: None,
            ready_delay: Duration::from_secs(1),
            additional_timeout: Duration::ZERO,
            step_timeout: None,
            fail_on_warning: true,
            flaky: false,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn ready_when(mut self, ready: ReadyPredicate) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    pub fn additional_timeout(mut self, timeout: Duration) -> Self {
        self.additional_timeout = timeout;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn fail_on_warning(mut self, fail: bool) -> Self {
        self.fail_on_warning = fail;
        self
    }

    pub fn flaky(mut self, flaky: bool) -> Self {
        self.flaky = flaky;
        self
    }

    pub fn ready_predicate(&self) -> ReadyPredicate {
        self.ready.clone().unwrap_or_else(|| ReadyPredicate::Default {
            server_url: Some(format!("{}/", self.server_url.trim_end_matches('/'))),
        })
    }

    /// Added on top of every base timeout; the settle delay counts towards it.
    pub fn effective_additional_timeout(&self) -> Duration {
        self.additional_timeout + self.ready_delay
    }

    /// Base timeouts stretched for this run.
    pub fn effective_timeouts(&self, base: &Timeouts) -> Timeouts {
        let extra = self.effective_additional_timeout();
        Timeouts {
            server_ready: base.server_ready + extra,
            step: self.step_timeout.unwrap_or(base.step) + extra,
            termination: base.termination,
            browser: base.browser + extra,
            auto_retry: base.auto_retry,
        }
    }

    pub fn port(&self) -> Option<u16> {
        port_of(&self.server_url)
    }
}

pub type StepFn = Box<dyn FnOnce(StepContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct TestStep {
    pub description: String,
    pub thunk: StepFn,
}

impl TestStep {
    pub fn new<F, Fut>(description: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            description: description.into(),
            thunk: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

impl fmt::Debug for TestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestStep")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// State of the test file currently being loaded or executed.
pub struct TestFileRun {
    file_path: PathBuf,
    test_name: String,
    phase: Phase,
    parameters: Option<RunParameters>,
    steps: Vec<TestStep>,
    skipped_reason: Option<String>,
    page: Option<Arc<dyn BrowserPage>>,
}

impl TestFileRun {
    fn new(file_path: PathBuf, root: &Path) -> Self {
        let test_name = test_name(&file_path, root);
        Self {
            file_path,
            test_name,
            phase: Phase::Loading,
            parameters: None,
            steps: Vec::new(),
            skipped_reason: None,
            page: None,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn parameters(&self) -> Option<&RunParameters> {
        self.parameters.as_ref()
    }

    pub fn skipped_reason(&self) -> Option<&str> {
        self.skipped_reason.as_deref()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Directory relative paths in the test file resolve against.
    pub fn test_dir(&self) -> PathBuf {
        self.file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> E2eResult<()> {
        self.ensure_loading("skip()")?;
        ensure_usage(self.parameters.is_none(), || {
            "You cannot call `skip()` after calling `run()`".into()
        })?;
        ensure_usage(self.steps.is_empty(), || {
            "You cannot call `skip()` after calling `test()`".into()
        })?;
        self.skipped_reason = Some(reason.into());
        Ok(())
    }

    pub fn configure_run(&mut self, parameters: RunParameters) -> E2eResult<()> {
        self.ensure_loading("run()")?;
        ensure_usage(self.skipped_reason.is_none(), || {
            "You cannot call `run()` after calling `skip()`".into()
        })?;
        ensure_usage(self.parameters.is_none(), || {
            "You cannot call `run()` twice".into()
        })?;
        self.parameters = Some(parameters);
        Ok(())
    }

    pub fn register_step(&mut self, step: TestStep) -> E2eResult<()> {
        self.ensure_loading("test()")?;
        ensure_usage(self.skipped_reason.is_none(), || {
            "You cannot call `test()` after calling `skip()`".into()
        })?;
        self.steps.push(step);
        Ok(())
    }

    /// Convenience wrapper around [`register_step`](Self::register_step).
    pub fn test<F, Fut>(&mut self, description: impl Into<String>, f: F) -> E2eResult<()>
    where
        F: FnOnce(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_step(TestStep::new(description, f))
    }

    fn ensure_loading(&self, call: &str) -> E2eResult<()> {
        ensure_usage(self.phase == Phase::Loading, || {
            format!("`{}` can only be called while the test file is loading", call)
        })
    }

    /// Leave `Loading`: either skipped, or waiting to boot its server.
    pub fn finish_loading(&mut self) -> E2eResult<Phase> {
        if self.skipped_reason.is_some() {
            self.advance(Phase::Skipped)?;
            return Ok(Phase::Skipped);
        }
        ensure_usage(self.parameters.is_some(), || {
            if self.steps.is_empty() {
                "The test file doesn't call `run()` nor `skip()`".into()
            } else {
                "You must call `run()` before running tests".into()
            }
        })?;
        self.advance(Phase::AwaitingRun)?;
        Ok(Phase::AwaitingRun)
    }

    pub fn advance(&mut self, next: Phase) -> E2eResult<()> {
        ensure_invariant(self.phase.can_advance_to(next), || {
            format!(
                "invalid phase transition {} -> {} for {}",
                self.phase,
                next,
                self.file_path.display()
            )
        })?;
        self.phase = next;
        Ok(())
    }

    /// Hand the registered steps over for execution, in registration order.
    pub fn take_steps(&mut self) -> Vec<TestStep> {
        std::mem::take(&mut self.steps)
    }

    pub fn set_page(&mut self, page: Arc<dyn BrowserPage>) {
        self.page = Some(page);
    }

    pub fn page(&self) -> Option<Arc<dyn BrowserPage>> {
        self.page.clone()
    }

    pub fn take_page(&mut self) -> Option<Arc<dyn BrowserPage>> {
        self.page.take()
    }

    /// Summary printed with internal errors.
    pub fn debug_info(&self) -> String {
        format!(
            "phase: {}\nfile: {}\nparameters: {:#?}\nsteps: {}\nskipped: {:?}",
            self.phase,
            self.file_path.display(),
            self.parameters,
            self.steps.len(),
            self.skipped_reason
        )
    }
}

/// Name shown in log lines: the example directory for files under `examples`,
/// otherwise the path relative to the root.
pub fn test_name(file_path: &Path, root: &Path) -> String {
    let relative = file_path.strip_prefix(root).unwrap_or(file_path);
    let under_examples = relative
        .components()
        .any(|c| c == Component::Normal("examples".as_ref()));
    let shown = if under_examples {
        relative.parent().unwrap_or(relative)
    } else {
        relative
    };
    format!("/{}", shown.to_string_lossy().replace('\\', "/"))
}

/// Guards the single live [`TestFileRun`].
#[derive(Clone, Default)]
pub struct RunSlot {
    held: Arc<AtomicBool>,
}

impl RunSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `file_path`; fails as a bug while another run is live.
    pub fn acquire(&self, file_path: impl Into<PathBuf>, root: &Path) -> E2eResult<CurrentRun> {
        let file_path = file_path.into();
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(E2eError::bug(format!(
                "cannot load {} while another test file is running",
                file_path.display()
            )));
        }
        Ok(CurrentRun {
            run: TestFileRun::new(file_path, root),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// The live run; releases the slot when dropped.
pub struct CurrentRun {
    run: TestFileRun,
    held: Arc<AtomicBool>,
}

impl Deref for CurrentRun {
    type Target = TestFileRun;

    fn deref(&self) -> &TestFileRun {
        &self.run
    }
}

impl DerefMut for CurrentRun {
    fn deref_mut(&mut self) -> &mut TestFileRun {
        &mut self.run
    }
}

impl Drop for CurrentRun {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Populates a [`TestFileRun`] from a test file.
pub trait TestFileLoader: Send + Sync {
    fn load(&self, path: &Path, run: &mut TestFileRun) -> E2eResult<()>;
}

impl<F> TestFileLoader for F
where
    F: Fn(&Path, &mut TestFileRun) -> E2eResult<()> + Send + Sync,
{
    fn load(&self, path: &Path, run: &mut TestFileRun) -> E2eResult<()> {
        self(path, run)
    }
}

const AUTO_RETRY_PERIOD: Duration = Duration::from_millis(100);

/// Default limit of [`StepContext::run_command`]
pub const RUN_COMMAND_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// What a running step can reach: the page, the logs and the server.
#[derive(Clone)]
pub struct StepContext {
    page: Arc<dyn BrowserPage>,
    logs: LogStore,
    files: FileEditor,
    server_url: String,
    test_dir: PathBuf,
    /// Working directory of the server command
    cwd: PathBuf,
    timeouts: Timeouts,
    http: reqwest::Client,
}

impl StepContext {
    pub fn new(
        page: Arc<dyn BrowserPage>,
        logs: LogStore,
        files: FileEditor,
        server_url: impl Into<String>,
        test_dir: impl Into<PathBuf>,
        timeouts: Timeouts,
    ) -> Self {
        let test_dir = test_dir.into();
        Self {
            page,
            logs,
            files,
            server_url: server_url.into(),
            cwd: test_dir.clone(),
            test_dir,
            timeouts,
            http: reqwest::Client::new(),
        }
    }

    /// Directory [`run_command`](Self::run_command) runs in; defaults to the
    /// test file's directory.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn page(&self) -> &dyn BrowserPage {
        self.page.as_ref()
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn files(&self) -> &FileEditor {
        &self.files
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn test_dir(&self) -> &Path {
        &self.test_dir
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn url(&self, pathname: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), pathname)
    }

    /// Navigate the page to a path of the server.
    pub async fn goto(&self, pathname: &str) -> E2eResult<()> {
        self.page.goto(&self.url(pathname)).await
    }

    /// GET a path of the server. Connection failures are recorded in the log.
    pub async fn fetch(&self, pathname: &str) -> E2eResult<reqwest::Response> {
        let url = self.url(pathname);
        match self.http.get(&url).send().await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.logs.add(
                    LogSource::ConnectionError,
                    format!("Couldn't connect to `{}`. Err: `{}`", url, e),
                );
                Err(E2eError::Connection)
            }
        }
    }

    pub async fn fetch_html(&self, pathname: &str) -> E2eResult<String> {
        let response = self.fetch(pathname).await?;
        Ok(response.text().await?)
    }

    pub fn expect_log(&self, substring: &str) -> E2eResult<()> {
        self.logs.expect_log(substring, None)
    }

    pub fn expect_log_matching(
        &self,
        substring: &str,
        filter: impl Fn(&LogEntry) -> bool + Send + Sync,
    ) -> E2eResult<()> {
        self.logs.expect_log(substring, Some(&filter))
    }

    pub fn edit_file(
        &self,
        path: impl AsRef<Path>,
        transform: impl FnOnce(&str) -> String,
    ) -> E2eResult<()> {
        let path = path.as_ref();
        if path.is_absolute() {
            self.files.edit_file(path, transform)
        } else {
            self.files.edit_file(self.test_dir.join(path), transform)
        }
    }

    pub fn revert_files(&self) -> E2eResult<()> {
        self.files.revert_all()
    }

    /// Run a command that is expected to finish, such as a build, and return
    /// its stdout. A non-zero exit, any stderr output or running past
    /// `timeout` (two minutes by default) is an error.
    pub async fn run_command(&self, cmd: &str, timeout: Option<Duration>) -> E2eResult<String> {
        let timeout = timeout.unwrap_or(RUN_COMMAND_TIMEOUT);
        let failed = |reason: String| E2eError::Command {
            cmd: cmd.to_string(),
            cwd: self.cwd.clone(),
            reason,
        };

        self.logs
            .add(LogSource::TestEvent, format!("Run command `{}`", cmd));
        let mut command = shell_command(cmd);
        command
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(output) => output?,
            Err(_) => return Err(failed(format!("timeout after {}", humanize_time(timeout)))),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(cmd, status = %output.status, "Command finished");
        if !output.status.success() {
            return Err(failed(format!("{}\n{}", output.status, stderr.trim_end())));
        }
        if !stderr.is_empty() {
            return Err(failed(format!("unexpected stderr\n{}", stderr.trim_end())));
        }
        Ok(stdout)
    }

    /// Retry `attempt` every 100 ms until it succeeds or the auto-retry window
    /// closes; the last error is returned.
    pub async fn auto_retry<F, Fut, T>(&self, attempt: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        auto_retry(self.timeouts.auto_retry, attempt).await
    }
}

pub async fn auto_retry<F, Fut, T>(window: Duration, mut attempt: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let deadline = Instant::now() + window;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(AUTO_RETRY_PERIOD).await,
        }
    }
}
