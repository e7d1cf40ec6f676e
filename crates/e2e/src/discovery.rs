//! Test file discovery

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::{E2eError, E2eResult};

/// Environment variable listing explicit test files, space-separated.
pub const TEST_FILES_ENV: &str = "TEST_FILES";

const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "target"];

/// Substring filter on test file paths relative to the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFilter {
    pub terms: Vec<String>,
    /// Keep paths matching none of the terms instead of all of them
    pub exclude: bool,
}

impl FileFilter {
    pub fn new(terms: Vec<String>, exclude: bool) -> Option<Self> {
        if terms.is_empty() {
            None
        } else {
            Some(Self { terms, exclude })
        }
    }

    pub fn matches(&self, relative_path: &str) -> bool {
        if self.exclude {
            !self.terms.iter().any(|t| relative_path.contains(t.as_str()))
        } else {
            self.terms.iter().all(|t| relative_path.contains(t.as_str()))
        }
    }
}

/// Test files to run: `TEST_FILES` if given, otherwise a scan of `root`.
pub fn find_test_files(
    root: &Path,
    suffixes: &[String],
    filter: Option<&FileFilter>,
    explicit: Option<&str>,
) -> E2eResult<Vec<PathBuf>> {
    match explicit {
        Some(list) => parse_test_files(list, root),
        None => scan(root, suffixes, filter),
    }
}

/// Parse an explicit, space-separated list of paths relative to `root`.
pub fn parse_test_files(list: &str, root: &Path) -> E2eResult<Vec<PathBuf>> {
    list.split_whitespace()
        .map(|relative| {
            let path = root.join(relative);
            if path.is_file() {
                Ok(path)
            } else {
                Err(E2eError::usage(format!(
                    "{} lists {} which doesn't exist",
                    TEST_FILES_ENV,
                    path.display()
                )))
            }
        })
        .collect()
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map_or(false, |name| SKIPPED_DIRS.contains(&name))
}

fn scan(root: &Path, suffixes: &[String], filter: Option<&FileFilter>) -> E2eResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_skipped_dir(e)) {
        let entry = entry.map_err(|e| E2eError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if filter.map_or(true, |f| f.matches(&relative)) {
            files.push(entry.into_path());
        }
    }

    if let Some(tracked) = git_files(root) {
        let before = files.len();
        files.retain(|f| tracked.contains(f));
        debug!("{} git-ignored test file(s) dropped", before - files.len());
    }

    files.sort();
    Ok(files)
}

/// Tracked plus untracked-but-not-ignored files; `None` outside a git work tree.
fn git_files(root: &Path) -> Option<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    for args in [&["ls-files"][..], &["ls-files", "--others", "--exclude-standard"][..]] {
        let output = Command::new("git")
            .args(args)
            .current_dir(root)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            debug!("Not a git work tree: {}", root.display());
            return None;
        }
        files.extend(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| root.join(l)),
        );
    }
    Some(files)
}
