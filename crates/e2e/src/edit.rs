//! File edits made by test steps, with their original content kept for revert

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// Records the original content of every file a step edits.
#[derive(Clone)]
pub struct FileEditor {
    base_dir: PathBuf,
    originals: Arc<Mutex<BTreeMap<PathBuf, String>>>,
}

impl FileEditor {
    /// Relative paths resolve against `base_dir` (the test file's directory).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            originals: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Rewrite a file through `transform`. A transform that changes nothing is
    /// a usage error.
    pub fn edit_file(
        &self,
        path: impl AsRef<Path>,
        transform: impl FnOnce(&str) -> String,
    ) -> E2eResult<()> {
        let path = self.resolve(path.as_ref());
        let content = std::fs::read_to_string(&path)
            .map_err(|_| E2eError::TestFileNotFound(path.clone()))?;
        let edited = transform(&content);
        if edited == content {
            return Err(E2eError::usage(format!(
                "editing {} did not change its content",
                path.display()
            )));
        }
        self.originals
            .lock()
            .entry(path.clone())
            .or_insert(content);
        std::fs::write(&path, edited)?;
        debug!("Edited {}", path.display());
        Ok(())
    }

    /// Restore every edited file.
    pub fn revert_all(&self) -> E2eResult<()> {
        let originals = std::mem::take(&mut *self.originals.lock());
        for (path, content) in originals {
            std::fs::write(&path, content)?;
            debug!("Reverted {}", path.display());
        }
        Ok(())
    }

    pub fn dirty_files(&self) -> Vec<PathBuf> {
        self.originals.lock().keys().cloned().collect()
    }

    /// Fails when a step left edits behind; the files are reverted either way.
    pub fn assert_all_reverted(&self) -> E2eResult<()> {
        let dirty = self.dirty_files();
        if dirty.is_empty() {
            return Ok(());
        }
        self.revert_all()?;
        let list = dirty
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(E2eError::usage(format!(
            "the step edited files without reverting them: {}",
            list
        )))
    }

    /// Hook run after each step: keep clean state on success, force-revert on failure.
    pub fn after_step(&self, step_failed: bool) -> E2eResult<()> {
        if step_failed {
            self.revert_all()
        } else {
            self.assert_all_reverted()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_then_revert_restores_first_original() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>Hello</h1>").unwrap();
        let editor = FileEditor::new(dir.path());

        editor
            .edit_file("index.html", |c| c.replace("Hello", "Bonjour"))
            .unwrap();
        editor
            .edit_file("index.html", |c| c.replace("Bonjour", "Hallo"))
            .unwrap();
        assert_eq!(editor.dirty_files().len(), 1);

        editor.revert_all().unwrap();
        let content = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert_eq!(content, "<h1>Hello</h1>");
        assert!(editor.dirty_files().is_empty());
    }

    #[test]
    fn unchanged_edit_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "same").unwrap();
        let editor = FileEditor::new(dir.path());
        let err = editor.edit_file("a.txt", |c| c.to_string()).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn after_step_success_flags_leftover_edits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let editor = FileEditor::new(dir.path());
        editor.edit_file("a.txt", |_| "two".into()).unwrap();

        let err = editor.after_step(false).unwrap_err();
        assert!(err.to_string().contains("without reverting"));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one");
    }

    #[test]
    fn after_step_failure_reverts_silently() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        let editor = FileEditor::new(dir.path());
        editor.edit_file("a.txt", |_| "two".into()).unwrap();

        editor.after_step(true).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one");
    }
}
