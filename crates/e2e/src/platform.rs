//! Platform and CI detection

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Mac,
    Windows,
    /// Any other POSIX system (BSDs, illumos, ...)
    OtherUnix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::OtherUnix
        }
    }

    pub fn is_windows(self) -> bool {
        self == Platform::Windows
    }

    pub fn is_linux(self) -> bool {
        self == Platform::Linux
    }

    /// Whether the platform's force-kill utility makes the killed shell emit a
    /// spurious non-zero exit narrative on stderr after the process exited.
    pub fn emits_post_kill_stderr(self) -> bool {
        self.is_windows()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Linux => "linux",
            Platform::Mac => "darwin",
            Platform::Windows => "win32",
            Platform::OtherUnix => "unix",
        };
        f.write_str(name)
    }
}

/// `CI` set to a non-empty value.
pub fn is_ci() -> bool {
    std::env::var_os("CI").map(|v| !v.is_empty()).unwrap_or(false)
}

/// Renders a duration the way failure messages show it: seconds below two
/// minutes, minutes above, one decimal.
pub fn humanize_time(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 120.0 {
        return format!("{:.1} seconds", seconds);
    }
    format!("{:.1} minutes", seconds / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(500, "0.5 seconds")]
    #[test_case(2_000, "2.0 seconds")]
    #[test_case(119_900, "119.9 seconds")]
    #[test_case(120_000, "2.0 minutes")]
    #[test_case(630_000, "10.5 minutes")]
    fn humanize(ms: u64, expected: &str) {
        assert_eq!(humanize_time(Duration::from_millis(ms)), expected);
    }

    #[test]
    fn only_windows_emits_post_kill_stderr() {
        assert!(Platform::Windows.emits_post_kill_stderr());
        assert!(!Platform::Linux.emits_post_kill_stderr());
        assert!(!Platform::Mac.emits_post_kill_stderr());
    }
}
