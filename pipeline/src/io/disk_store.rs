//! [`FileStore`] over a workspace directory.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::apply::{FileStore, validate_relative_path};

/// Reads and writes repo-relative paths under `root`.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = validate_relative_path(path)?;
        Ok(self.root.join(rel))
    }
}

impl FileStore for DiskStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        let full = self.resolve(path)?;
        match fs::read_to_string(&full) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", full.display())),
        }
    }

    fn write(&mut self, path: &str, contents: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&full, contents).with_context(|| format!("write {}", full.display()))
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => {
                prune_empty_parents(&self.root, &full);
                Ok(())
            }
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", full.display())),
        }
    }
}

/// Remove directories emptied by a deletion, stopping at `root`.
fn prune_empty_parents(root: &Path, removed: &Path) {
    let mut dir = removed.parent();
    while let Some(current) = dir {
        if current == root || fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::apply::{ApplyScope, apply_patch};
    use crate::core::diff::parse_patch;

    #[test]
    fn applies_patch_to_disk_and_prunes_deleted_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("old/nested")).expect("mkdir");
        fs::write(root.join("old/nested/gone.js"), "bye\n").expect("write");
        fs::write(root.join("app.js"), "a\nb\n").expect("write");

        let patch = parse_patch(concat!(
            "diff --git a/app.js b/app.js\n",
            "--- a/app.js\n",
            "+++ b/app.js\n",
            "@@ -1,2 +1,3 @@\n",
            " a\n",
            "+x\n",
            " b\n",
            "diff --git a/old/nested/gone.js b/old/nested/gone.js\n",
            "deleted file mode 100644\n",
            "--- a/old/nested/gone.js\n",
            "+++ /dev/null\n",
            "@@ -1 +0,0 @@\n",
            "-bye\n",
            "diff --git a/src/new.js b/src/new.js\n",
            "new file mode 100644\n",
            "--- /dev/null\n",
            "+++ b/src/new.js\n",
            "@@ -0,0 +1 @@\n",
            "+hello\n",
        ))
        .expect("parse");
        let scope = ApplyScope::new(
            Vec::new(),
            ["app.js", "old/nested/gone.js", "src/new.js"]
                .into_iter()
                .map(String::from)
                .collect(),
        );
        let mut store = DiskStore::new(root);
        let changed = apply_patch(&patch, &mut store, &scope).expect("apply");

        assert_eq!(changed.len(), 3);
        assert_eq!(fs::read_to_string(root.join("app.js")).expect("read"), "a\nx\nb\n");
        assert_eq!(fs::read_to_string(root.join("src/new.js")).expect("read"), "hello\n");
        assert!(!root.join("old").exists());
    }

    #[test]
    fn rejects_escaping_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::new(temp.path());
        assert!(store.read("../etc/passwd").is_err());
    }
}
