//! Server process supervision - spawning, readiness detection and termination
//!
//! ```text
//!  ProcessSupervisor::start(LaunchSpec)
//!        │ spawn `sh -c <cmd>` in its own process group
//!        ▼
//!  ┌──────────── Monitor task (owns the Child) ────────────┐
//!  │ stdout chunk ─► LogStore + readiness predicate        │
//!  │ stderr chunk ─► LogStore (+ EADDRINUSE check)         │
//!  │ exit         ─► classify, settle readiness, ack       │
//!  │ ready timer  ─► force-terminate, then reject          │
//!  │ Control::Terminate ─► Terminator backend + deadline   │
//!  └───────────────────────────────────────────────────────┘
//!        │ oneshot (settled once)       │ mpsc
//!        ▼                              ▼
//!  ServerHandle::wait_ready()     ServerHandle::terminate()
//! ```

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::logs::{LogSource, LogStore};
use crate::platform::{humanize_time, Platform};

/// How long output is still collected after the process was reaped.
const EXIT_DRAIN_WINDOW: Duration = Duration::from_millis(250);

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI escape pattern is valid")
});

pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Decides from a chunk of (ANSI-stripped) stdout that the server is up.
#[derive(Clone)]
pub enum ReadyPredicate {
    Literal(String),
    Matcher(Arc<dyn Fn(&str) -> bool + Send + Sync>),
    /// Banners of well-known dev servers; Vite's banner is matched against the
    /// server URL.
    Default { server_url: Option<String> },
}

impl ReadyPredicate {
    pub fn literal(text: impl Into<String>) -> Self {
        ReadyPredicate::Literal(text.into())
    }

    pub fn regex(regex: Regex) -> Self {
        ReadyPredicate::Matcher(Arc::new(move |output| regex.is_match(output)))
    }

    pub fn matcher(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        ReadyPredicate::Matcher(Arc::new(f))
    }

    pub fn matches(&self, output: &str) -> bool {
        match self {
            ReadyPredicate::Literal(text) => output.contains(text.as_str()),
            ReadyPredicate::Matcher(f) => f(output),
            ReadyPredicate::Default { server_url } => {
                let url = server_url.as_deref().unwrap_or("http://localhost:3000/");
                output.contains("Server running at")
                    || output.contains("Accepting connections at")
                    || (output.contains("Local:") && output.contains(url))
            }
        }
    }

    fn expected_text(&self) -> Option<&str> {
        match self {
            ReadyPredicate::Literal(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Debug for ReadyPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyPredicate::Literal(text) => f.debug_tuple("Literal").field(text).finish(),
            ReadyPredicate::Matcher(_) => f.write_str("Matcher(..)"),
            ReadyPredicate::Default { server_url } => f
                .debug_struct("Default")
                .field("server_url", server_url)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    Graceful,
    Forced,
}

/// Platform backend that delivers a termination request to a process tree.
pub trait Terminator: Send + Sync {
    fn terminate(&self, pid: u32, mode: TerminationMode) -> E2eResult<()>;

    /// Whether terminating through this backend is known to make the killed
    /// shell exit with code 1.
    fn induces_exit_code_one(&self) -> bool {
        false
    }
}

/// Signals the whole process group the server was spawned into.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct ProcessGroupTerminator;

#[cfg(unix)]
impl Terminator for ProcessGroupTerminator {
    fn terminate(&self, pid: u32, mode: TerminationMode) -> E2eResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let signal = match mode {
            TerminationMode::Graceful => Signal::SIGTERM,
            TerminationMode::Forced => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            // Group already gone
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(E2eError::Io(std::io::Error::from(e))),
        }
    }
}

/// Kills the process tree with `taskkill /f /t`; used where there are no
/// POSIX process groups.
#[derive(Debug, Default)]
pub struct TreeKillTerminator;

impl Terminator for TreeKillTerminator {
    fn terminate(&self, pid: u32, _mode: TerminationMode) -> E2eResult<()> {
        std::process::Command::new("taskkill")
            .args(["/pid", &pid.to_string(), "/f", "/t"])
            .stdin(Stdio::null())
            // "SUCCESS: The process with PID ..." is noise
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(())
    }

    fn induces_exit_code_one(&self) -> bool {
        true
    }
}

pub fn platform_terminator() -> Arc<dyn Terminator> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroupTerminator)
    }
    #[cfg(not(unix))]
    {
        Arc::new(TreeKillTerminator)
    }
}

/// Everything needed to start and watch one server process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub cmd: String,
    pub cwd: PathBuf,
    pub ready: ReadyPredicate,
    pub ready_timeout: Duration,
    /// Settle time between the readiness match and reporting ready
    pub ready_delay: Duration,
    pub termination_timeout: Duration,
    /// Kill whatever listens on this TCP port before spawning
    pub kill_port: Option<u16>,
}

/// Counts monitors that still own a server process, so that an interrupted
/// run can wait for the process groups to be killed before exiting.
#[derive(Debug, Clone)]
pub struct LiveServers(Arc<watch::Sender<usize>>);

impl Default for LiveServers {
    fn default() -> Self {
        Self(Arc::new(watch::channel(0).0))
    }
}

impl LiveServers {
    pub fn count(&self) -> usize {
        *self.0.borrow()
    }

    /// Resolves once no monitor is left.
    pub async fn wait_idle(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    fn enter(&self) -> LiveGuard {
        self.0.send_modify(|count| *count += 1);
        LiveGuard(self.clone())
    }
}

struct LiveGuard(LiveServers);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0 .0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

pub struct ProcessSupervisor {
    logs: LogStore,
    terminator: Arc<dyn Terminator>,
    live: LiveServers,
}

impl ProcessSupervisor {
    pub fn new(logs: LogStore) -> Self {
        Self::with_terminator(logs, platform_terminator())
    }

    pub fn with_terminator(logs: LogStore, terminator: Arc<dyn Terminator>) -> Self {
        Self {
            logs,
            terminator,
            live: LiveServers::default(),
        }
    }

    /// Count this supervisor's monitors in `live`.
    pub fn tracking(mut self, live: LiveServers) -> Self {
        self.live = live;
        self
    }

    /// Spawn the command and start watching it.
    pub async fn start(&self, spec: LaunchSpec) -> E2eResult<ServerHandle> {
        if let Some(port) = spec.kill_port {
            kill_port(port).await;
        }

        self.logs
            .add(LogSource::RunEvent, format!("Spawn command `{}`", spec.cmd));

        let mut cmd = shell_command(&spec.cmd);
        cmd.current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!(
                "Failed to spawn `{}` in {}: {}",
                spec.cmd,
                spec.cwd.display(),
                e
            ))
        })?;
        let pid = child.id();
        info!(pid, cmd = %spec.cmd, "Server process spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (control_tx, control_rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        let monitor = Monitor {
            started: Instant::now(),
            cmd: spec.cmd,
            cwd: spec.cwd,
            ready: spec.ready,
            ready_timeout: spec.ready_timeout,
            ready_delay: spec.ready_delay,
            termination_timeout: spec.termination_timeout,
            child,
            pid,
            logs: self.logs.clone(),
            terminator: self.terminator.clone(),
            ready_tx: Some(ready_tx),
            matched: false,
            timed_out: false,
            settle_at: None,
            pending_failure: None,
            terminating: false,
            force_killed: false,
            reaped: None,
            exited: false,
            exit_tx,
            waiters: Vec::new(),
            termination_deadline: None,
            _live: self.live.enter(),
        };
        let task = tokio::spawn(monitor.run(stdout, stderr, control_rx));

        Ok(ServerHandle {
            pid,
            control: control_tx,
            ready: Some(ready_rx),
            exited: exit_rx,
            task,
        })
    }
}

enum Control {
    Terminate {
        force: bool,
        ack: oneshot::Sender<()>,
    },
}

/// Caller's view of a supervised server: a readiness future and a way to stop it.
pub struct ServerHandle {
    pid: Option<u32>,
    control: mpsc::Sender<Control>,
    ready: Option<oneshot::Receiver<E2eResult<()>>>,
    exited: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves once the readiness predicate matched and the settle delay
    /// elapsed; rejects on timeout, port conflict or premature exit. A
    /// rejection is only delivered once the process is gone (or the
    /// termination timeout gave up on it).
    pub async fn wait_ready(&mut self) -> E2eResult<()> {
        let rx = self
            .ready
            .take()
            .ok_or_else(|| E2eError::bug("server readiness awaited twice"))?;
        rx.await
            .unwrap_or_else(|_| Err(E2eError::bug("server monitor ended before settling readiness")))
    }

    /// Ask the process tree to stop and wait for it to exit, at most the
    /// termination timeout. A no-op once the process has exited.
    pub async fn terminate(&self, force: bool) {
        let (ack, done) = oneshot::channel();
        if self
            .control
            .send(Control::Terminate { force, ack })
            .await
            .is_err()
        {
            return;
        }
        let _ = done.await;
    }

    /// Resolves when the process has exited.
    pub async fn wait_exit(&mut self) {
        let _ = self.exited.wait_for(|exited| *exited).await;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.task.is_finished() {
            return;
        }
        debug!(pid = ?self.pid, "Server handle dropped; monitor will force-kill the process group");
    }
}

struct Monitor {
    started: Instant,
    cmd: String,
    cwd: PathBuf,
    ready: ReadyPredicate,
    ready_timeout: Duration,
    ready_delay: Duration,
    termination_timeout: Duration,
    child: Child,
    pid: Option<u32>,
    logs: LogStore,
    terminator: Arc<dyn Terminator>,
    /// Taken when readiness settles; `None` means settled.
    ready_tx: Option<oneshot::Sender<E2eResult<()>>>,
    matched: bool,
    timed_out: bool,
    settle_at: Option<Instant>,
    /// Startup failure held back until the process is confirmed gone.
    pending_failure: Option<E2eError>,
    terminating: bool,
    force_killed: bool,
    /// Exit code collected from the OS, with the end of the pipe drain window
    reaped: Option<(Option<i32>, Instant)>,
    /// Exit has been classified and reported
    exited: bool,
    exit_tx: watch::Sender<bool>,
    waiters: Vec<oneshot::Sender<()>>,
    termination_deadline: Option<Instant>,
    _live: LiveGuard,
}

impl Monitor {
    async fn run<O, E>(
        mut self,
        mut stdout: Option<O>,
        mut stderr: Option<E>,
        mut control: mpsc::Receiver<Control>,
    ) where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut out_buf = vec![0u8; 8 * 1024];
        let mut err_buf = vec![0u8; 8 * 1024];
        let mut out_text = Utf8Decoder::default();
        let mut err_text = Utf8Decoder::default();
        let mut control_open = true;
        let ready_deadline = self.started + self.ready_timeout;

        loop {
            if let Some((_, drain_until)) = self.reaped {
                let drained = stdout.is_none() && stderr.is_none();
                if !self.exited && (drained || Instant::now() >= drain_until) {
                    self.report_exit();
                }
            }
            if self.exited
                && !self.settle_pending()
                && ((stdout.is_none() && stderr.is_none()) || !control_open)
            {
                break;
            }

            let reaped = self.reaped.is_some();
            let draining = reaped && !self.exited;
            let drain_until = or_never(self.reaped.map(|(_, until)| until));
            let awaiting_match =
                self.ready_tx.is_some() && !self.matched && self.pending_failure.is_none();
            let settling = self.ready_tx.is_some() && self.settle_at.is_some();
            let settle_at = or_never(self.settle_at);
            let watching_termination = self.termination_deadline.is_some();
            let termination_deadline = or_never(self.termination_deadline);

            tokio::select! {
                chunk = read_chunk(&mut stdout, &mut out_buf, &mut out_text), if stdout.is_some() => match chunk {
                    Some(text) => self.on_stdout(text),
                    None => stdout = None,
                },
                chunk = read_chunk(&mut stderr, &mut err_buf, &mut err_text), if stderr.is_some() => match chunk {
                    Some(text) => self.on_stderr(text),
                    None => stderr = None,
                },
                status = self.child.wait(), if !reaped => self.on_reaped(status),
                _ = sleep_until(drain_until), if draining => {}
                _ = sleep_until(ready_deadline), if awaiting_match && !reaped => self.on_ready_timeout(),
                _ = sleep_until(settle_at), if settling => {
                    self.settle_at = None;
                    self.settle(Ok(()));
                }
                _ = sleep_until(termination_deadline), if watching_termination => self.on_termination_timeout(),
                msg = control.recv(), if control_open => match msg {
                    Some(Control::Terminate { force, ack }) => self.on_terminate(force, ack),
                    None => {
                        control_open = false;
                        self.send_signal(TerminationMode::Forced);
                    }
                },
            }
        }

        debug!(cmd = %self.cmd, "Server monitor finished");
    }

    fn after_exit(&self) -> bool {
        self.reaped.is_some()
    }

    /// Matched, but the settle delay has not run out yet.
    fn settle_pending(&self) -> bool {
        self.ready_tx.is_some() && self.settle_at.is_some()
    }

    fn on_stdout(&mut self, text: String) {
        self.logs
            .add_process_output(LogSource::Stdout, text.as_str(), self.after_exit());

        if self.ready_tx.is_none() || self.matched || self.pending_failure.is_some() {
            return;
        }
        if self.ready.matches(&strip_ansi(&text)) {
            self.matched = true;
            info!(cmd = %self.cmd, elapsed = ?self.started.elapsed(), "Server is ready");
            self.logs.add(LogSource::RunEvent, "Server is ready.");
            if self.ready_delay.is_zero() {
                self.settle(Ok(()));
            } else {
                self.settle_at = Some(Instant::now() + self.ready_delay);
            }
        }
    }

    fn on_stderr(&mut self, text: String) {
        let port_conflict = text.contains("EADDRINUSE");
        self.logs
            .add_process_output(LogSource::Stderr, text, self.after_exit());
        if port_conflict && self.ready_tx.is_some() && !self.matched {
            self.fail_startup(E2eError::PortConflict);
        }
    }

    fn on_ready_timeout(&mut self) {
        self.timed_out = true;
        let expected = self
            .ready
            .expected_text()
            .map(|text| format!(" The stdout of the command did not (yet?) include \"{}\".", text))
            .unwrap_or_default();
        warn!(cmd = %self.cmd, "Server not ready before timeout");
        self.fail_startup(E2eError::ServerNotReady {
            cmd: self.cmd.clone(),
            elapsed: humanize_time(self.ready_timeout),
            expected,
        });
    }

    /// Kill the process, then reject readiness once it is gone.
    fn fail_startup(&mut self, err: E2eError) {
        if self.pending_failure.is_some() {
            return;
        }
        if self.exited {
            self.settle(Err(err));
            return;
        }
        self.pending_failure = Some(err);
        if !self.after_exit() {
            self.send_signal(TerminationMode::Forced);
            self.termination_deadline
                .get_or_insert_with(|| Instant::now() + self.termination_timeout);
        }
    }

    fn on_reaped(&mut self, status: std::io::Result<ExitStatus>) {
        let code = match &status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "Failed to wait for server process");
                None
            }
        };
        self.reaped = Some((code, Instant::now() + EXIT_DRAIN_WINDOW));
    }

    /// Classify the exit once the output pipes are drained.
    fn report_exit(&mut self) {
        self.exited = true;
        let _ = self.exit_tx.send(true);

        let code = self.reaped.and_then(|(code, _)| code);
        let code_str = code.map_or_else(|| "null".to_string(), |c| c.to_string());
        let success = self.is_success_code(code);
        let expected = self.matched || self.timed_out || self.terminating;
        let clean_exit_while_settling = self.settle_pending() && self.pending_failure.is_none();

        let failure = if !success && self.terminating {
            Some(format!(
                "Command `{}` ({}) terminated with non-0 error code {}",
                self.cmd,
                self.cwd.display(),
                code_str
            ))
        } else if !success {
            Some(format!(
                "Unexpected termination of command `{}` with exit code {}",
                self.cmd, code_str
            ))
        } else if !expected {
            Some(format!(
                "Unexpected premature termination of command `{}` (with success exit code {})",
                self.cmd, code_str
            ))
        } else {
            None
        };

        match &failure {
            Some(msg) => self.logs.add(LogSource::RunFailure, msg.as_str()),
            None => self
                .logs
                .add(LogSource::RunEvent, "Process termination (expected)"),
        }
        info!(cmd = %self.cmd, code = %code_str, "Server process exited");

        // A clean exit during the settle delay still waits for the delay to run out.
        if self.ready_tx.is_some() && !(clean_exit_while_settling && failure.is_none()) {
            let outcome = if let Some(err) = self.pending_failure.take() {
                Err(err)
            } else if let Some(msg) = failure {
                Err(E2eError::UnexpectedExit(msg))
            } else if self.matched {
                Ok(())
            } else {
                Err(E2eError::ServerStartup(format!(
                    "command `{}` was terminated before it became ready",
                    self.cmd
                )))
            };
            self.settle(outcome);
        }

        self.termination_deadline = None;
        self.ack_waiters();
    }

    /// Exit codes that count as a clean shutdown. Code 1 only counts once we
    /// asked a backend known to cause it to terminate the process.
    fn is_success_code(&self, code: Option<i32>) -> bool {
        match code {
            None | Some(0) => true,
            Some(1) => self.terminating && self.terminator.induces_exit_code_one(),
            Some(_) => false,
        }
    }

    fn on_terminate(&mut self, force: bool, ack: oneshot::Sender<()>) {
        if self.exited {
            let _ = ack.send(());
            return;
        }
        self.waiters.push(ack);
        if self.after_exit() {
            return;
        }
        let mode = if force {
            TerminationMode::Forced
        } else {
            TerminationMode::Graceful
        };
        if !self.terminating || (force && !self.force_killed) {
            self.send_signal(mode);
        }
        self.termination_deadline
            .get_or_insert_with(|| Instant::now() + self.termination_timeout);
    }

    fn on_termination_timeout(&mut self) {
        self.termination_deadline = None;
        let msg = format!("Process termination timeout. Cmd: {}", self.cmd);
        warn!(cmd = %self.cmd, "Server did not exit within the termination timeout");
        self.logs.add(LogSource::RunFailure, msg);
        if !self.force_killed {
            self.send_signal(TerminationMode::Forced);
        }
        if let Some(err) = self.pending_failure.take() {
            self.settle(Err(err));
        }
        self.ack_waiters();
    }

    /// No-op once the process has been reaped; its pid may be reused.
    fn send_signal(&mut self, mode: TerminationMode) {
        if self.after_exit() {
            return;
        }
        self.terminating = true;
        if mode == TerminationMode::Forced {
            self.force_killed = true;
        }
        let Some(pid) = self.pid else {
            return;
        };
        debug!(pid, ?mode, "Signalling server process tree");
        if let Err(e) = self.terminator.terminate(pid, mode) {
            self.logs.add(
                LogSource::RunFailure,
                format!("Failed to terminate command `{}`: {}", self.cmd, e),
            );
        }
    }

    fn settle(&mut self, outcome: E2eResult<()>) {
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(outcome);
        }
    }

    fn ack_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn or_never(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 60 * 60))
}

/// Decodes a byte stream as UTF-8, holding back a character split across reads.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(std::str::from_utf8(&self.pending[..valid_up_to]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + len);
                        }
                        // Incomplete sequence at the end; wait for the next read
                        None => {
                            self.pending.drain(..valid_up_to);
                            return text;
                        }
                    }
                }
            }
        }
    }

    /// Whatever is left at EOF, lossily.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// Next chunk of decoded output; `None` once the pipe is at EOF (or failed)
/// and nothing is left to flush.
async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
    decoder: &mut Utf8Decoder,
) -> Option<String> {
    loop {
        let n = match reader.as_mut()?.read(buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Server output pipe closed");
                0
            }
        };
        if n == 0 {
            *reader = None;
            return decoder.finish();
        }
        let text = decoder.decode(&buf[..n]);
        if !text.is_empty() {
            return Some(text);
        }
    }
}

pub(crate) fn shell_command(cmd: &str) -> Command {
    if Platform::current().is_windows() {
        let mut command = Command::new("cmd");
        command.args(["/C", cmd]);
        command
    } else {
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        command
    }
}

/// Free a port held by a stale server from an aborted run. Errors are ignored.
async fn kill_port(port: u16) {
    let run = Command::new("fuser")
        .arg("-k")
        .arg(format!("{}/tcp", port))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match tokio::time::timeout(Duration::from_secs(10), run).await {
        Ok(Ok(status)) => debug!(port, %status, "fuser -k finished"),
        Ok(Err(e)) => debug!(port, error = %e, "fuser -k could not run"),
        Err(_) => warn!(port, "fuser -k timed out"),
    }
}

/// Port of a URL such as `http://localhost:3000/about`.
pub fn port_of(url: &str) -> Option<u16> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}
