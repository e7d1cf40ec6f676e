//! Stagehand E2E Test Orchestrator
//!
//! Runs end-to-end test files one after another. For each file it:
//! - Spawns the application under test as a child process
//! - Waits for a readiness banner in the process output
//! - Drives a Playwright browser against it, one page per file
//! - Runs the registered steps, checking the log after each one
//! - Terminates the process tree and classifies any stray output
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TestRunner                                                  │
//! │    ├── Config (stagehand.toml) + discovery (walkdir / git)   │
//! │    ├── PlaywrightDriver -> Browser (one per batch)           │
//! │    └── RetryScheduler                                        │
//! │          └── FileExecutor (state machine, one file a time)   │
//! │                ├── TestFileLoader -> TestFileRun             │
//! │                ├── ProcessSupervisor -> ServerHandle         │
//! │                ├── StepContext (page, logs, file editor)     │
//! │                └── LogStore (tolerate rules, flush)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod config;
pub mod context;
pub mod discovery;
pub mod edit;
pub mod error;
pub mod logs;
pub mod machine;
pub mod platform;
pub mod playwright;
pub mod runner;
pub mod scheduler;
pub mod spec;
pub mod status;
pub mod supervisor;

pub use context::{RunParameters, StepContext, TestFileLoader, TestFileRun};
pub use error::{E2eError, E2eResult};
pub use logs::{LogSource, LogStore, TolerateRule};
pub use machine::{FailureReason, FileExecutor, FileOutcome, Verdict};
pub use runner::{RunnerConfig, TestRunner};
pub use scheduler::{BatchReport, RetryScheduler, RunFile, SchedulerOptions};
pub use supervisor::{LaunchSpec, LiveServers, ProcessSupervisor, ReadyPredicate, ServerHandle};
