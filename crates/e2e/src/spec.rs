//! Declarative YAML test files
//!
//! ```yaml
//! run:
//!   cmd: npm run preview
//!   server_url: http://localhost:3000
//!   ready: { contains: "Accepting connections at" }
//! tests:
//!   - description: renders the landing page
//!     steps:
//!       - action: navigate
//!         url: /
//!       - action: assert_text
//!         selector: h1
//!         contains: Welcome
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{RunParameters, StepContext, TestFileLoader, TestFileRun, DEFAULT_SERVER_URL};
use crate::error::{E2eError, E2eResult};
use crate::logs::LogSource;
use crate::platform::Platform;
use crate::supervisor::ReadyPredicate;

/// A test file parsed from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestFileSpec {
    /// Skip the whole file with this reason
    #[serde(default)]
    pub skip: Option<String>,

    /// Skip the file when any of these hold
    #[serde(default)]
    pub skip_on: Vec<SkipCondition>,

    #[serde(default)]
    pub run: Option<RunSpec>,

    #[serde(default)]
    pub tests: Vec<TestCase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCondition {
    Windows,
    Mac,
    Linux,
    Ci,
}

impl SkipCondition {
    fn holds(self, platform: Platform, ci: bool) -> bool {
        match self {
            SkipCondition::Windows => platform == Platform::Windows,
            SkipCondition::Mac => platform == Platform::Mac,
            SkipCondition::Linux => platform == Platform::Linux,
            SkipCondition::Ci => ci,
        }
    }
}

impl fmt::Display for SkipCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SkipCondition::Windows => "Windows",
            SkipCondition::Mac => "macOS",
            SkipCondition::Linux => "Linux",
            SkipCondition::Ci => "CI",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    pub cmd: String,

    /// Relative to the test file's directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default)]
    pub ready: Option<ReadySpec>,

    /// Settle time after the readiness match
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,

    #[serde(default)]
    pub additional_timeout_ms: u64,

    /// Per-step timeout override
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default = "default_true")]
    pub fail_on_warning: bool,

    #[serde(default)]
    pub flaky: bool,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_ready_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// Readiness text: exactly one of `contains` or `regex`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadySpec {
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
}

impl ReadySpec {
    fn predicate(&self) -> E2eResult<ReadyPredicate> {
        match (&self.contains, &self.regex) {
            (Some(text), None) => Ok(ReadyPredicate::literal(text.as_str())),
            (None, Some(pattern)) => Ok(ReadyPredicate::regex(Regex::new(pattern)?)),
            _ => Err(E2eError::usage(
                "`run.ready` needs exactly one of `contains` or `regex`",
            )),
        }
    }
}

impl RunSpec {
    fn parameters(&self, test_dir: &Path) -> E2eResult<RunParameters> {
        let mut params = RunParameters::new(&self.cmd)
            .server_url(&self.server_url)
            .ready_delay(Duration::from_millis(self.ready_delay_ms))
            .additional_timeout(Duration::from_millis(self.additional_timeout_ms))
            .fail_on_warning(self.fail_on_warning)
            .flaky(self.flaky);
        if let Some(cwd) = &self.cwd {
            params = params.cwd(test_dir.join(cwd));
        }
        if let Some(ms) = self.timeout_ms {
            params = params.step_timeout(Duration::from_millis(ms));
        }
        if let Some(ready) = &self.ready {
            params = params.ready_when(ready.predicate()?);
        }
        Ok(params)
    }
}

/// One registered step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestCase {
    pub description: String,
    pub steps: Vec<Action>,
}

/// A single browser or server interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Navigate to a URL; paths are relative to the server URL
    Navigate {
        url: String,
        #[serde(default)]
        wait_for_selector: Option<String>,
    },

    Click {
        selector: String,
    },

    Fill {
        selector: String,
        value: String,
    },

    Press {
        key: String,
    },

    /// Wait for an element to appear
    Wait {
        selector: String,
    },

    AssertText {
        selector: String,
        #[serde(default)]
        equals: Option<String>,
        #[serde(default)]
        contains: Option<String>,
    },

    /// GET a path of the server and check the HTML
    FetchHtml {
        path: String,
        #[serde(default)]
        contains: Vec<String>,
        #[serde(default)]
        not_contains: Vec<String>,
    },

    /// Tolerate an error the test provokes on purpose
    ExpectLog {
        text: String,
        #[serde(default)]
        source: Option<LogSource>,
    },

    /// Replace text in a file, relative to the test file
    EditFile {
        path: PathBuf,
        replace: String,
        with: String,
    },

    RevertFiles,

    /// Short-lived command in the run's working directory
    RunCommand {
        cmd: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    Sleep {
        ms: u64,
    },

    Log {
        message: String,
    },

    /// Retry the nested actions until they pass or the auto-retry window closes
    AutoRetry {
        steps: Vec<Action>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::Fill { .. } => "fill",
            Action::Press { .. } => "press",
            Action::Wait { .. } => "wait",
            Action::AssertText { .. } => "assert_text",
            Action::FetchHtml { .. } => "fetch_html",
            Action::ExpectLog { .. } => "expect_log",
            Action::EditFile { .. } => "edit_file",
            Action::RevertFiles => "revert_files",
            Action::RunCommand { .. } => "run_command",
            Action::Sleep { .. } => "sleep",
            Action::Log { .. } => "log",
            Action::AutoRetry { .. } => "auto_retry",
        }
    }

    pub fn perform<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            match self {
                Action::Navigate {
                    url,
                    wait_for_selector,
                } => {
                    let target = if url.starts_with('/') {
                        ctx.url(url)
                    } else {
                        url.clone()
                    };
                    ctx.page().goto(&target).await?;
                    if let Some(selector) = wait_for_selector {
                        ctx.page().wait_for_selector(selector).await?;
                    }
                }
                Action::Click { selector } => ctx.page().click(selector).await?,
                Action::Fill { selector, value } => ctx.page().fill(selector, value).await?,
                Action::Press { key } => ctx.page().press(key).await?,
                Action::Wait { selector } => ctx.page().wait_for_selector(selector).await?,
                Action::AssertText {
                    selector,
                    equals,
                    contains,
                } => {
                    let Some(text) = ctx.page().text_content(selector).await? else {
                        bail!("no element matches `{}`", selector);
                    };
                    if let Some(expected) = equals {
                        if text.trim() != expected {
                            bail!("`{}` has text {:?}, expected {:?}", selector, text.trim(), expected);
                        }
                    }
                    if let Some(expected) = contains {
                        if !text.contains(expected.as_str()) {
                            bail!("`{}` text {:?} does not contain {:?}", selector, text, expected);
                        }
                    }
                }
                Action::FetchHtml {
                    path,
                    contains,
                    not_contains,
                } => {
                    let html = ctx.fetch_html(path).await?;
                    for expected in contains {
                        if !html.contains(expected.as_str()) {
                            bail!("HTML of `{}` does not contain {:?}", path, expected);
                        }
                    }
                    for unexpected in not_contains {
                        if html.contains(unexpected.as_str()) {
                            bail!("HTML of `{}` unexpectedly contains {:?}", path, unexpected);
                        }
                    }
                }
                Action::ExpectLog { text, source } => match source {
                    Some(source) => {
                        let source = *source;
                        ctx.expect_log_matching(text, move |entry| entry.source == source)?
                    }
                    None => ctx.expect_log(text)?,
                },
                Action::EditFile {
                    path,
                    replace,
                    with,
                } => ctx.edit_file(path, |content| content.replace(replace.as_str(), with))?,
                Action::RevertFiles => ctx.revert_files()?,
                Action::RunCommand { cmd, timeout_ms } => {
                    let stdout = ctx
                        .run_command(cmd, timeout_ms.map(Duration::from_millis))
                        .await?;
                    debug!(cmd = %cmd, "{}", stdout.trim_end());
                }
                Action::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
                Action::Log { message } => ctx.logs().add(LogSource::TestEvent, message.as_str()),
                Action::AutoRetry { steps } => {
                    ctx.auto_retry(|| async move {
                        for action in steps {
                            action.perform(ctx).await?;
                        }
                        Ok(())
                    })
                    .await?
                }
            }
            Ok(())
        })
    }
}

impl TestFileSpec {
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| E2eError::usage(format!("cannot read test file {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&content)
            .map_err(|e| E2eError::usage(format!("invalid test file {}: {}", path.display(), e)))
    }

    /// Perform the registration calls this file describes.
    pub fn register(&self, run: &mut TestFileRun, platform: Platform, ci: bool) -> E2eResult<()> {
        if let Some(condition) = self.skip_on.iter().find(|c| c.holds(platform, ci)) {
            return run.skip(format!("skipped on {}", condition));
        }
        if let Some(reason) = &self.skip {
            run.skip(reason.as_str())?;
        }
        if let Some(spec) = &self.run {
            let params = spec.parameters(&run.test_dir()).map_err(|e| match e {
                E2eError::Regex(e) => E2eError::usage(format!("invalid `ready.regex`: {}", e)),
                other => other,
            })?;
            run.configure_run(params)?;
        }
        for case in &self.tests {
            let actions = Arc::new(case.steps.clone());
            run.test(case.description.as_str(), move |ctx| async move {
                for (i, action) in actions.iter().enumerate() {
                    action
                        .perform(&ctx)
                        .await
                        .with_context(|| format!("action #{} `{}` failed", i + 1, action.name()))?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

/// Loads `.test.yaml` files.
#[derive(Debug, Clone, Copy)]
pub struct YamlLoader {
    platform: Platform,
    ci: bool,
}

impl YamlLoader {
    pub fn new(platform: Platform, ci: bool) -> Self {
        Self { platform, ci }
    }
}

impl TestFileLoader for YamlLoader {
    fn load(&self, path: &Path, run: &mut TestFileRun) -> E2eResult<()> {
        let spec = TestFileSpec::from_file(path)?;
        debug!(
            "Loaded {} ({} test(s))",
            path.display(),
            spec.tests.len()
        );
        spec.register(run, self.platform, self.ci)
    }
}
