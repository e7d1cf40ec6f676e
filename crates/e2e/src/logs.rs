//! Log store - timestamped, multi-source event log with tolerate rules
//!
//! Child-process output and browser console messages arrive asynchronously, so
//! failures are detected by inspecting the accumulated log after each step
//! rather than by exceptions. Entries are stamped on arrival; the store is the
//! single place where "did anything go wrong since the last clear" is decided.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Local};
use colored::{ColoredString, Colorize};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{E2eError, E2eResult};
use crate::platform::Platform;
use crate::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogSource {
    Stdout,
    Stderr,
    BrowserError,
    BrowserWarning,
    BrowserLog,
    /// The browser driver process itself
    Driver,
    RunEvent,
    RunFailure,
    TestEvent,
    ConnectionError,
}

impl LogSource {
    pub fn label(self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::BrowserError => "Browser Error",
            LogSource::BrowserWarning => "Browser Warning",
            LogSource::BrowserLog => "Browser Log",
            LogSource::Driver => "Playwright",
            LogSource::RunEvent => "run()",
            LogSource::RunFailure => "run() failure",
            LogSource::TestEvent => "test()",
            LogSource::ConnectionError => "Connection Error",
        }
    }

    fn colorize(self) -> ColoredString {
        let label = self.label();
        match self {
            LogSource::Stderr | LogSource::BrowserError => label.red().bold(),
            LogSource::Stdout | LogSource::BrowserLog => label.blue().bold(),
            LogSource::BrowserWarning => label.yellow().bold(),
            LogSource::Driver => label.magenta().bold(),
            LogSource::RunEvent | LogSource::RunFailure => label.yellow().bold(),
            LogSource::TestEvent => label.cyan().bold(),
            LogSource::ConnectionError => label.red(),
        }
    }

    fn is_warning(self) -> bool {
        matches!(self, LogSource::BrowserWarning | LogSource::Stderr)
    }

    fn is_error(self) -> bool {
        matches!(self, LogSource::BrowserError | LogSource::RunFailure)
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub source: LogSource,
    pub text: String,
    pub timestamp: DateTime<Local>,
    /// Arrived after the owning process's exit event fired.
    pub logged_after_exit: bool,
    /// Tolerated: kept in the record but never counted as a failure.
    pub suppressed: bool,
}

impl LogEntry {
    /// Whether this entry makes the current step fail.
    pub fn is_failure(&self, include_warnings: bool, platform: Platform) -> bool {
        if self.suppressed {
            return false;
        }
        if self.logged_after_exit
            && self.source == LogSource::Stderr
            && platform.emits_post_kill_stderr()
        {
            return false;
        }
        self.source.is_error() || (include_warnings && self.source.is_warning())
    }
}

type LogPredicate = dyn Fn(&LogEntry) -> bool + Send + Sync;

/// Marks matching entries as non-failing when they are added.
#[derive(Clone)]
pub enum TolerateRule {
    Contains {
        source: Option<LogSource>,
        text: String,
    },
    Regex {
        source: Option<LogSource>,
        regex: Regex,
    },
    Predicate(Arc<LogPredicate>),
}

impl TolerateRule {
    pub fn contains(source: Option<LogSource>, text: impl Into<String>) -> Self {
        TolerateRule::Contains {
            source,
            text: text.into(),
        }
    }

    pub fn predicate(f: impl Fn(&LogEntry) -> bool + Send + Sync + 'static) -> Self {
        TolerateRule::Predicate(Arc::new(f))
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        match self {
            TolerateRule::Contains { source, text } => {
                source.map_or(true, |s| s == entry.source) && entry.text.contains(text.as_str())
            }
            TolerateRule::Regex { source, regex } => {
                source.map_or(true, |s| s == entry.source) && regex.is_match(&entry.text)
            }
            TolerateRule::Predicate(f) => f(entry),
        }
    }

    /// Noise every run tolerates.
    pub fn builtin() -> Vec<TolerateRule> {
        vec![
            TolerateRule::contains(
                Some(LogSource::Stderr),
                "ExperimentalWarning: The Fetch API is an experimental feature. This feature could change at any time",
            ),
            // Emitted by esbuild's service when the server it belongs to is killed.
            TolerateRule::contains(
                Some(LogSource::Stderr),
                "The service was stopped: write EPIPE",
            ),
        ]
    }
}

impl fmt::Debug for TolerateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TolerateRule::Contains { source, text } => f
                .debug_struct("Contains")
                .field("source", source)
                .field("text", text)
                .finish(),
            TolerateRule::Regex { source, regex } => f
                .debug_struct("Regex")
                .field("source", source)
                .field("regex", &regex.as_str())
                .finish(),
            TolerateRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<LogEntry>,
    /// Index of the first entry not yet printed.
    unprinted: usize,
    last_timestamp: Option<DateTime<Local>>,
    test_name: String,
    cmd: Option<String>,
    flush_eagerly: bool,
}

/// Shared handle to the log of the file currently running.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<Mutex<Inner>>,
    rules: Arc<Vec<TolerateRule>>,
    platform: Platform,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LogStore {
    /// Create a store with the built-in tolerate rules plus `rules`.
    pub fn new(rules: Vec<TolerateRule>) -> Self {
        Self::with_platform(rules, Platform::current())
    }

    pub fn with_platform(rules: Vec<TolerateRule>, platform: Platform) -> Self {
        let mut all = TolerateRule::builtin();
        all.extend(rules);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            rules: Arc::new(all),
            platform,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Name and command shown in every printed line.
    pub fn set_label(&self, test_name: impl Into<String>, cmd: Option<String>) {
        let mut inner = self.inner.lock();
        inner.test_name = test_name.into();
        inner.cmd = cmd;
    }

    /// Print each entry as soon as it is added.
    pub fn set_flush_eagerly(&self, eager: bool) {
        self.inner.lock().flush_eagerly = eager;
    }

    pub fn add(&self, source: LogSource, text: impl Into<String>) {
        self.add_entry(source, text.into(), false);
    }

    /// Record child-process output, noting whether the process had already exited.
    pub fn add_process_output(&self, source: LogSource, text: impl Into<String>, logged_after_exit: bool) {
        self.add_entry(source, text.into(), logged_after_exit);
    }

    fn add_entry(&self, source: LogSource, text: String, logged_after_exit: bool) {
        let mut entry = LogEntry {
            source,
            text,
            timestamp: Local::now(),
            logged_after_exit,
            suppressed: false,
        };
        entry.suppressed = self.rules.iter().any(|rule| rule.matches(&entry));

        let mut inner = self.inner.lock();
        // Wall clocks can step backwards; arrival order wins.
        if let Some(last) = inner.last_timestamp {
            if entry.timestamp < last {
                entry.timestamp = last;
            }
        }
        inner.last_timestamp = Some(entry.timestamp);
        inner.entries.push(entry);

        if inner.flush_eagerly {
            let mut stderr = std::io::stderr().lock();
            let _ = print_pending(&mut inner, &mut stderr);
        }
    }

    /// Whether any non-suppressed failure-worthy entry exists.
    pub fn has_fail_logs(&self, include_warnings: bool) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .any(|e| e.is_failure(include_warnings, self.platform))
    }

    pub fn failing_entries(&self, include_warnings: bool) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|e| e.is_failure(include_warnings, self.platform))
            .cloned()
            .collect()
    }

    /// Tolerate entries the test expected.
    ///
    /// Every entry whose text contains `substring` (and passes `filter`, when
    /// given) is suppressed. Fails if nothing contains `substring`, or if
    /// something does but none of those pass `filter`.
    pub fn expect_log(
        &self,
        substring: &str,
        filter: Option<&(dyn Fn(&LogEntry) -> bool + Send + Sync)>,
    ) -> E2eResult<()> {
        let mut inner = self.inner.lock();
        let mut text_matches = 0usize;
        let mut marked = 0usize;
        for entry in inner.entries.iter_mut() {
            if !entry.text.contains(substring) {
                continue;
            }
            text_matches += 1;
            if filter.map_or(true, |f| f(entry)) {
                entry.suppressed = true;
                marked += 1;
            }
        }
        if text_matches == 0 {
            return Err(E2eError::ExpectLog(format!(
                "no log contains `{}`",
                substring
            )));
        }
        if marked == 0 {
            return Err(E2eError::ExpectLog(format!(
                "{} log(s) contain `{}` but none passed the filter",
                text_matches, substring
            )));
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Print everything gathered since the last clear to stderr.
    pub fn flush(&self) {
        let mut stderr = std::io::stderr().lock();
        let _ = self.flush_to(&mut stderr);
    }

    pub fn flush_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        print_pending(&mut inner, out)
    }

    /// Print only the entries that make the run fail, under their own section.
    pub fn log_errors(&self, include_warnings: bool) {
        let failing = self.failing_entries(include_warnings);
        if failing.is_empty() {
            return;
        }
        let title = if include_warnings {
            "ERROR & WARNING LOGS"
        } else {
            "ERROR LOGS"
        };
        status::log_section(title);
        let inner = self.inner.lock();
        let mut stderr = std::io::stderr().lock();
        for entry in &failing {
            let _ = print_entry(&inner, entry, &mut stderr);
        }
    }

    /// Discard the buffer.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.unprinted = 0;
    }
}

fn print_pending(inner: &mut Inner, out: &mut dyn Write) -> std::io::Result<()> {
    let start = inner.unprinted.min(inner.entries.len());
    for entry in &inner.entries[start..] {
        print_entry(inner, entry, out)?;
    }
    inner.unprinted = inner.entries.len();
    out.flush()
}

fn print_entry(inner: &Inner, entry: &LogEntry, out: &mut dyn Write) -> std::io::Result<()> {
    let mut text = entry.text.clone();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    let cmd = inner
        .cmd
        .as_deref()
        .map(|c| format!("[{}]", c))
        .unwrap_or_default();
    write!(
        out,
        "[{}][{}]{}[{}] {}",
        entry.timestamp.format("%H:%M:%S%.3f"),
        inner.test_name,
        cmd,
        entry.source.colorize(),
        text
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LogStore {
        LogStore::with_platform(Vec::new(), Platform::Linux)
    }

    #[test]
    fn errors_fail_regardless_of_order() {
        let logs = store();
        logs.add(LogSource::Stdout, "hello");
        logs.add(LogSource::BrowserError, "Uncaught TypeError");
        logs.add(LogSource::BrowserLog, "hydrated");
        assert!(logs.has_fail_logs(false));

        let logs = store();
        logs.add(LogSource::RunFailure, "Process termination timeout");
        logs.add(LogSource::Stdout, "hello");
        assert!(logs.has_fail_logs(false));
    }

    #[test]
    fn warnings_only_fail_when_included() {
        let logs = store();
        logs.add(LogSource::Stderr, "deprecated option");
        logs.add(LogSource::BrowserWarning, "slow network");
        assert!(!logs.has_fail_logs(false));
        assert!(logs.has_fail_logs(true));
        assert_eq!(logs.failing_entries(true).len(), 2);
    }

    #[test]
    fn builtin_rules_tolerate_epipe() {
        let logs = store();
        logs.add(LogSource::Stderr, "The service was stopped: write EPIPE");
        assert!(!logs.has_fail_logs(true));
        assert!(logs.entries()[0].suppressed);
    }

    #[test]
    fn caller_rules_tolerate() {
        let logs = LogStore::with_platform(
            vec![
                TolerateRule::contains(Some(LogSource::BrowserError), "favicon.ico"),
                TolerateRule::predicate(|e| e.text.starts_with("[HMR]")),
            ],
            Platform::Linux,
        );
        logs.add(LogSource::BrowserError, "GET /favicon.ico 404");
        logs.add(LogSource::Stderr, "[HMR] connected");
        // Rule bound to a source does not leak to others.
        logs.add(LogSource::RunFailure, "favicon.ico");
        assert_eq!(logs.failing_entries(true).len(), 1);
    }

    #[test]
    fn post_exit_stderr_is_ignored_only_on_windows() {
        let windows = LogStore::with_platform(Vec::new(), Platform::Windows);
        windows.add_process_output(LogSource::Stderr, "npm ERR! code ELIFECYCLE", true);
        assert!(!windows.has_fail_logs(true));
        windows.add_process_output(LogSource::Stderr, "real problem", false);
        assert!(windows.has_fail_logs(true));

        let linux = store();
        linux.add_process_output(LogSource::Stderr, "npm ERR! code ELIFECYCLE", true);
        assert!(linux.has_fail_logs(true));
    }

    #[test]
    fn expect_log_marks_only_matching_entries() {
        let logs = store();
        logs.add(LogSource::BrowserError, "Failed to fetch /api");
        logs.add(LogSource::BrowserError, "Something else broke");
        logs.add(LogSource::RunFailure, "Failed to fetch /api twice");
        logs.expect_log("Failed to fetch", None).unwrap();

        let suppressed: Vec<bool> = logs.entries().iter().map(|e| e.suppressed).collect();
        assert_eq!(suppressed, vec![true, false, true]);
        assert!(logs.has_fail_logs(false));
    }

    #[test]
    fn expect_log_fails_without_match() {
        let logs = store();
        logs.add(LogSource::BrowserError, "boom");
        let err = logs.expect_log("kaboom", None).unwrap_err();
        assert!(matches!(err, E2eError::ExpectLog(_)));
        assert!(!logs.entries()[0].suppressed);
    }

    #[test]
    fn expect_log_filter_must_match() {
        let logs = store();
        logs.add(LogSource::Stdout, "boom");
        let only_browser = |e: &LogEntry| e.source == LogSource::BrowserError;
        let err = logs.expect_log("boom", Some(&only_browser)).unwrap_err();
        assert!(err.to_string().contains("none passed the filter"));

        logs.add(LogSource::BrowserError, "boom");
        logs.expect_log("boom", Some(&only_browser)).unwrap();
        let suppressed: Vec<bool> = logs.entries().iter().map(|e| e.suppressed).collect();
        assert_eq!(suppressed, vec![false, true]);
    }

    #[test]
    fn timestamps_are_non_decreasing() {
        let logs = store();
        for i in 0..50 {
            logs.add(LogSource::Stdout, format!("line {}", i));
        }
        let entries = logs.entries();
        assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn flush_prints_each_entry_once() {
        let logs = store();
        logs.set_label("/examples/react", Some("npm run dev".into()));
        logs.add(LogSource::Stdout, "Server running at :3000");

        let mut out = Vec::new();
        logs.flush_to(&mut out).unwrap();
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("[/examples/react][npm run dev]"));
        assert!(printed.contains("Server running at :3000\n"));

        let mut again = Vec::new();
        logs.flush_to(&mut again).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn clear_is_idempotent_and_empties_flush() {
        let logs = store();
        logs.add(LogSource::BrowserError, "boom");
        logs.clear();
        logs.clear();
        assert!(logs.is_empty());
        assert!(!logs.has_fail_logs(true));

        let mut out = Vec::new();
        logs.flush_to(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
