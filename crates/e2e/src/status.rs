//! Console status output: PASS/FAIL/WARN banners, sections, progress lines

use std::fmt::Display;
use std::io::{IsTerminal, Write};
use std::path::Path;

use colored::Colorize;

fn pass_tag() -> String {
    " PASS ".white().bold().on_green().to_string()
}

fn fail_tag() -> String {
    " FAIL ".white().bold().on_red().to_string()
}

fn warn_tag() -> String {
    " WARN ".white().bold().on_yellow().to_string()
}

pub fn log_pass(test_file: &Path) {
    println!("{} {}", pass_tag(), test_file.display());
}

pub fn log_warn(test_file: &Path, warning: &str) {
    println!("{} {} ({})", warn_tag(), test_file.display(), warning);
}

/// Hard failure banner followed by the reason.
pub fn log_fail(test_file: &Path, reason: &str) {
    println!("{} {}", fail_tag(), test_file.display());
    let msg = format!("Test {} because {}, see below.", fail_tag(), reason);
    println!("{}", msg.red().bold());
}

/// Failure of a file that still has retry attempts left.
pub fn log_will_retry(test_file: &Path, reason: &str) {
    println!(
        "{} {} (failed because {}; will retry)",
        warn_tag(),
        test_file.display(),
        reason
    );
}

pub fn log_retry_pass(pass: usize, of: usize, files: usize) {
    let msg = format!("Retrying {} failed flaky test file(s) ({}/{})", files, pass, of);
    println!("{}", msg.yellow().bold());
}

pub fn log_section(title: &str) {
    let title = format!("vvvvvv {} vvvvvv", title);
    let rule = "v".repeat(title.len());
    println!("{}", rule.bold());
    println!("{}", title.bold());
    println!("{}", rule.bold());
}

pub fn log_error(err: &dyn Display, title: &str) {
    log_section(title);
    println!("{}", err);
}

/// A pending line that turns green or red once finished. Silent when stdout is
/// not a terminal.
pub struct Progress {
    text: String,
    done: bool,
    tty: bool,
}

impl Progress {
    pub fn start(text: impl Into<String>) -> Self {
        let text = text.into();
        let tty = std::io::stdout().is_terminal();
        if tty {
            print!("🟠 {}", text);
            let _ = std::io::stdout().flush();
        }
        Self {
            text,
            done: false,
            tty,
        }
    }

    pub fn finish(&mut self, failed: bool) {
        if self.done {
            return;
        }
        self.done = true;
        if !self.tty {
            return;
        }
        let icon = if failed { "🔴" } else { "🟢" };
        print!("\r\x1b[2K{} {}\n", icon, self.text);
        let _ = std::io::stdout().flush();
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.finish(true);
    }
}
