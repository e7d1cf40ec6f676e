//! Retry scheduler
//!
//! One pass over every file, then, in CI only, up to `max_retries` passes over
//! the files that failed and allow retries. Files run strictly one at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::machine::FileOutcome;
use crate::status;

/// Runs a single test file attempt.
#[async_trait]
pub trait RunFile: Send + Sync {
    async fn run_file(&self, path: &Path, is_final_attempt: bool) -> FileOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub ci: bool,
    /// Stop at the first failure
    pub bail: bool,
    /// Extra passes in CI
    pub max_retries: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            ci: false,
            bail: false,
            max_retries: 2,
        }
    }
}

/// Outcome of a whole batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Still failing after every attempt, in listing order
    pub failed: Vec<PathBuf>,
    pub attempts: HashMap<PathBuf, usize>,
    /// Every attempt, in execution order
    pub outcomes: Vec<FileOutcome>,
    /// Stopped early by `bail` or a usage error
    pub aborted: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempts_of(&self, path: &Path) -> usize {
        self.attempts.get(path).copied().unwrap_or(0)
    }
}

pub struct RetryScheduler<R> {
    runner: R,
    options: SchedulerOptions,
}

impl<R: RunFile> RetryScheduler<R> {
    pub fn new(runner: R, options: SchedulerOptions) -> Self {
        Self { runner, options }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub async fn run_all(&self, files: &[PathBuf]) -> BatchReport {
        let mut report = BatchReport::default();
        let retries = if self.options.ci {
            self.options.max_retries
        } else {
            0
        };

        let mut retryable = Vec::new();
        for file in files {
            let outcome = self.attempt(&mut report, file, retries == 0).await;
            if !outcome.is_failure() {
                continue;
            }
            report.failed.push(file.clone());
            if outcome.flaky {
                retryable.push(file.clone());
            }
            if self.stops_batch(&outcome) {
                report.aborted = true;
                return report;
            }
        }

        for pass in 1..=retries {
            if retryable.is_empty() {
                break;
            }
            let is_final_attempt = pass == retries;
            status::log_retry_pass(pass, retries, retryable.len());
            info!(pass, files = retryable.len(), "Retrying flaky test files");

            let mut still_failing = Vec::new();
            for file in std::mem::take(&mut retryable) {
                let outcome = self.attempt(&mut report, &file, is_final_attempt).await;
                if !outcome.is_failure() {
                    report.failed.retain(|f| f != &file);
                    continue;
                }
                let stop = self.stops_batch(&outcome);
                still_failing.push(file);
                if stop {
                    report.aborted = true;
                    return report;
                }
            }
            retryable = still_failing;
        }

        report
    }

    async fn attempt(&self, report: &mut BatchReport, file: &Path, is_final_attempt: bool) -> FileOutcome {
        let outcome = self.runner.run_file(file, is_final_attempt).await;
        *report.attempts.entry(file.to_path_buf()).or_default() += 1;
        report.outcomes.push(outcome.clone());
        outcome
    }

    fn stops_batch(&self, outcome: &FileOutcome) -> bool {
        self.options.bail || outcome.is_usage_failure()
    }
}
