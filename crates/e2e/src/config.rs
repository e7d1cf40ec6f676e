//! Runner configuration: `stagehand.toml` plus environment-dependent timeouts

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::logs::{LogSource, TolerateRule};
use crate::platform::Platform;

pub const CONFIG_FILE_NAME: &str = "stagehand.toml";

/// Contents of `stagehand.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    /// Extra tolerate rules applied to every log entry
    pub tolerate: Vec<TolerateConfig>,

    /// Timeout overrides, in milliseconds
    pub timeouts: TimeoutOverrides,

    /// File-name suffixes identifying test files
    pub test_suffixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TolerateConfig {
    #[serde(default)]
    pub source: Option<LogSource>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
}

impl TolerateConfig {
    fn compile(&self, path: &Path) -> E2eResult<TolerateRule> {
        match (&self.contains, &self.regex) {
            (Some(text), None) => Ok(TolerateRule::contains(self.source, text.clone())),
            (None, Some(pattern)) => Ok(TolerateRule::Regex {
                source: self.source,
                regex: Regex::new(pattern)?,
            }),
            _ => Err(E2eError::Config {
                path: path.to_path_buf(),
                reason: "each [[tolerate]] rule needs exactly one of `contains` or `regex`".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutOverrides {
    pub server_ready_ms: Option<u64>,
    pub step_ms: Option<u64>,
    pub termination_ms: Option<u64>,
    pub browser_ms: Option<u64>,
    pub auto_retry_ms: Option<u64>,
}

/// Base timeouts, before a run's additional timeout is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Window for the server's readiness banner
    pub server_ready: Duration,
    /// Per test step
    pub step: Duration,
    /// Wait for the server process to exit once asked to
    pub termination: Duration,
    /// Default timeout of browser page operations
    pub browser: Duration,
    /// Window of `auto_retry`
    pub auto_retry: Duration,
}

impl Timeouts {
    /// Defaults scaled for slow CI machines.
    pub fn for_environment(platform: Platform, ci: bool) -> Self {
        let server_ready_factor = if ci && platform.is_windows() { 2 } else { 1 };
        let step_factor = match (ci, platform) {
            (false, _) => 1,
            (true, Platform::Windows) => 5,
            (true, _) => 3,
        };
        let termination_factor = if ci && !platform.is_linux() { 3 } else { 1 };

        let step = Duration::from_secs(60) * step_factor;
        Self {
            server_ready: Duration::from_secs(120) * server_ready_factor,
            step,
            termination: Duration::from_secs(10) * termination_factor,
            browser: step / 2,
            auto_retry: step / 2,
        }
    }

    fn apply(mut self, overrides: &TimeoutOverrides) -> Self {
        let ms = Duration::from_millis;
        if let Some(v) = overrides.server_ready_ms {
            self.server_ready = ms(v);
        }
        if let Some(v) = overrides.step_ms {
            self.step = ms(v);
        }
        if let Some(v) = overrides.termination_ms {
            self.termination = ms(v);
        }
        if let Some(v) = overrides.browser_ms {
            self.browser = ms(v);
        }
        if let Some(v) = overrides.auto_retry_ms {
            self.auto_retry = ms(v);
        }
        self
    }
}

/// Resolved configuration shared by every component of a run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the config file was found, if anywhere
    pub path: Option<PathBuf>,
    pub tolerate: Vec<TolerateRule>,
    pub timeouts: Timeouts,
    pub test_suffixes: Vec<String>,
    pub platform: Platform,
    pub ci: bool,
}

impl Config {
    /// Defaults for the current platform without any config file.
    pub fn defaults(platform: Platform, ci: bool) -> Self {
        Self {
            path: None,
            tolerate: Vec::new(),
            timeouts: Timeouts::for_environment(platform, ci),
            test_suffixes: default_suffixes(),
            platform,
            ci,
        }
    }

    /// Look for `stagehand.toml` from `start` upwards and load it.
    pub fn discover(start: &Path, platform: Platform, ci: bool) -> E2eResult<Self> {
        match find_config_file(start) {
            Some(path) => Self::load(&path, platform, ci),
            None => {
                debug!("No {} found above {}", CONFIG_FILE_NAME, start.display());
                Ok(Self::defaults(platform, ci))
            }
        }
    }

    pub fn load(path: &Path, platform: Platform, ci: bool) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content).map_err(|e| E2eError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_file(file, path, platform, ci)
    }

    pub fn from_file(file: ConfigFile, path: &Path, platform: Platform, ci: bool) -> E2eResult<Self> {
        let tolerate = file
            .tolerate
            .iter()
            .map(|rule| rule.compile(path))
            .collect::<E2eResult<Vec<_>>>()?;
        let test_suffixes = match file.test_suffixes {
            Some(suffixes) if suffixes.is_empty() => {
                return Err(E2eError::Config {
                    path: path.to_path_buf(),
                    reason: "`test_suffixes` must not be empty".into(),
                })
            }
            Some(suffixes) => suffixes,
            None => default_suffixes(),
        };
        debug!("Loaded configuration from {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            tolerate,
            timeouts: Timeouts::for_environment(platform, ci).apply(&file.timeouts),
            test_suffixes,
            platform,
            ci,
        })
    }
}

fn default_suffixes() -> Vec<String> {
    vec![".test.yaml".to_string(), ".test.yml".to_string()]
}

fn find_config_file(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}
