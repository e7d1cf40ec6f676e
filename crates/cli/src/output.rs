//! Output formatting for CLI

use std::path::PathBuf;

use colored::Colorize;

/// Summary printed when files are still failing after every attempt.
pub fn print_failed(files: &[PathBuf]) {
    eprintln!();
    eprintln!(
        "{}",
        "Following tests failed, see logs above for more information."
            .red()
            .bold()
    );
    for file in files {
        eprintln!("  {}", file.display());
    }
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}
