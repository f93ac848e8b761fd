//! Patch application with all-or-nothing semantics.
//!
//! Application runs in three phases: every file patch is resolved and applied
//! to an in-memory overlay, the resulting change set is checked against the
//! [`ApplyScope`], and only then are the buffered writes flushed to the
//! [`FileStore`]. A failure in the first two phases never touches storage; a
//! storage failure during the flush restores the files already written.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::diff::{FilePatch, Hunk, HunkLine, Patch};
use crate::error::{ErrorKind, PipelineError};

/// Storage the patch is applied to. Paths are repo-relative and `/`-separated.
pub trait FileStore {
    /// Return file contents, or `None` when the file does not exist.
    fn read(&self, path: &str) -> Result<Option<String>>;
    fn write(&mut self, path: &str, contents: &str) -> Result<()>;
    fn remove(&mut self, path: &str) -> Result<()>;
}

/// In-memory store used for dry runs in tests and by callers that stage edits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    pub files: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files.insert(path.to_string(), contents.to_string());
        self
    }
}

impl FileStore for MemoryStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.files.get(path).cloned())
    }

    fn write(&mut self, path: &str, contents: &str) -> Result<()> {
        self.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        self.files.remove(path);
        Ok(())
    }
}

/// Which paths a patch may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyScope {
    /// Directory prefixes that are always writable (pipeline bookkeeping).
    pub always_allowed_dirs: Vec<String>,
    /// Files pre-declared as impacted for this run.
    pub impacted: BTreeSet<String>,
}

impl ApplyScope {
    pub fn new(always_allowed_dirs: Vec<String>, impacted: BTreeSet<String>) -> Self {
        Self {
            always_allowed_dirs,
            impacted,
        }
    }

    pub fn allows(&self, path: &str) -> bool {
        self.impacted.contains(path) || self.in_always_allowed_dir(path)
    }

    /// True when `path` sits under one of the always-writable directories.
    pub fn in_always_allowed_dir(&self, path: &str) -> bool {
        self.always_allowed_dirs.iter().any(|dir| {
            let dir = dir.trim_end_matches('/');
            path.strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Buffered mutation for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    Write(String),
    Remove,
}

/// Result of applying a patch: the set of paths that changed.
pub type ChangedPaths = BTreeSet<String>;

/// Validate `patch` against `store` and `scope` without writing anything.
pub fn check_patch<S: FileStore>(patch: &Patch, store: &S, scope: &ApplyScope) -> Result<ChangedPaths> {
    let staged = stage_patch(patch, store)?;
    enforce_scope(&staged, scope)?;
    Ok(staged.keys().cloned().collect())
}

/// Apply `patch` to `store`, all-or-nothing.
pub fn apply_patch<S: FileStore>(patch: &Patch, store: &mut S, scope: &ApplyScope) -> Result<ChangedPaths> {
    let staged = stage_patch(patch, store)?;
    enforce_scope(&staged, scope)?;
    flush(&staged, store)?;
    debug!(files = staged.len(), "patch applied");
    Ok(staged.keys().cloned().collect())
}

/// Apply one file's hunks to `original`, returning the new contents.
///
/// Hunks run in order against one running line offset. A hunk with
/// `old_count == 0` inserts after line `old_start` (so `old_start == 0` inserts
/// at the top of the file); otherwise it replaces lines starting at
/// `old_start`.
///
/// The output keeps the original's trailing newline unless a hunk that
/// reaches the end of the file carries a `\ No newline at end of file`
/// marker, in which case the post-image side decides.
pub fn apply_hunks(path: &str, original: &str, hunks: &[Hunk]) -> Result<String, PipelineError> {
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
    let mut offset: isize = 0;
    let mut trailing_newline = original.is_empty() || original.ends_with('\n');

    for (idx, hunk) in hunks.iter().enumerate() {
        let anchor = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let start = anchor as isize + offset;
        if start < 0 || start as usize + hunk.old_count > lines.len() {
            return Err(apply_error(format!(
                "{path}: hunk {} (@@ -{},{}) is outside the file ({} lines)",
                idx + 1,
                hunk.old_start,
                hunk.old_count,
                lines.len()
            )));
        }
        let start = start as usize;
        if start + hunk.old_count == lines.len() {
            if hunk.no_newline_new {
                trailing_newline = false;
            } else if hunk.no_newline_old {
                trailing_newline = true;
            }
        }

        let mut cursor = start;
        let mut replacement = Vec::with_capacity(hunk.new_count);
        for line in &hunk.lines {
            match line {
                HunkLine::Context(text) => {
                    expect_line(path, &lines, cursor, text, "context")?;
                    replacement.push(text.clone());
                    cursor += 1;
                }
                HunkLine::Remove(text) => {
                    expect_line(path, &lines, cursor, text, "removed")?;
                    cursor += 1;
                }
                HunkLine::Add(text) => replacement.push(text.clone()),
            }
        }

        let inserted = replacement.len() as isize;
        lines.splice(start..start + hunk.old_count, replacement);
        offset += inserted - hunk.old_count as isize;
    }

    let mut out = lines.join("\n");
    if trailing_newline && !lines.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Reject absolute, drive-rooted, and parent-escaping paths.
pub fn validate_relative_path(path: &str) -> Result<String, PipelineError> {
    let trimmed = path.strip_prefix("./").unwrap_or(path);
    if trimmed.is_empty() {
        return Err(apply_error("empty target path"));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(apply_error(format!("absolute path not allowed: {path}")));
    }
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(apply_error(format!("drive-rooted path not allowed: {path}")));
    }
    if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(apply_error(format!("parent traversal not allowed: {path}")));
    }
    Ok(trimmed.to_string())
}

fn stage_patch<S: FileStore>(patch: &Patch, store: &S) -> Result<BTreeMap<String, Pending>> {
    let mut staged: BTreeMap<String, Pending> = BTreeMap::new();
    for file in &patch.files {
        stage_file(file, store, &mut staged)?;
    }
    Ok(staged)
}

fn stage_file<S: FileStore>(
    file: &FilePatch,
    store: &S,
    staged: &mut BTreeMap<String, Pending>,
) -> Result<()> {
    let raw = file.target_path().ok_or_else(|| {
        apply_error(format!(
            "cannot resolve a target path for {} -> {}",
            file.git_old, file.git_new
        ))
    })?;
    let path = validate_relative_path(raw)?;
    let current = match staged.get(&path) {
        Some(Pending::Write(contents)) => Some(contents.clone()),
        Some(Pending::Remove) => None,
        None => store.read(&path)?,
    };

    if file.is_delete() {
        let Some(existing) = current else {
            debug!(path = %path, "delete of missing file is a no-op");
            return Ok(());
        };
        apply_hunks(&path, &existing, &file.hunks)?;
        staged.insert(path, Pending::Remove);
        return Ok(());
    }

    let base = current.unwrap_or_default();
    let next = apply_hunks(&path, &base, &file.hunks)?;
    staged.insert(path, Pending::Write(next));
    Ok(())
}

fn enforce_scope(staged: &BTreeMap<String, Pending>, scope: &ApplyScope) -> Result<()> {
    let outside: Vec<&str> = staged
        .keys()
        .filter(|path| !scope.allows(path))
        .map(String::as_str)
        .collect();
    if outside.is_empty() {
        return Ok(());
    }
    Err(PipelineError::new(
        ErrorKind::ScopeViolation,
        format!("patch touches undeclared paths: {}", outside.join(", ")),
    )
    .into())
}

fn flush<S: FileStore>(staged: &BTreeMap<String, Pending>, store: &mut S) -> Result<()> {
    let mut originals: Vec<(String, Option<String>)> = Vec::with_capacity(staged.len());
    for (path, pending) in staged {
        let original = store.read(path)?;
        let outcome = match pending {
            Pending::Write(contents) => store.write(path, contents),
            Pending::Remove => store.remove(path),
        };
        if let Err(err) = outcome {
            warn!(path = %path, err = %err, "flush failed, restoring written files");
            restore_originals(store, &originals);
            return Err(err.context(format!("write {path}")));
        }
        originals.push((path.clone(), original));
    }
    Ok(())
}

fn restore_originals<S: FileStore>(store: &mut S, originals: &[(String, Option<String>)]) {
    for (path, original) in originals.iter().rev() {
        let outcome = match original {
            Some(contents) => store.write(path, contents),
            None => store.remove(path),
        };
        if let Err(err) = outcome {
            warn!(path = %path, err = %err, "failed to restore file after flush error");
        }
    }
}

fn expect_line(
    path: &str,
    lines: &[String],
    cursor: usize,
    expected: &str,
    role: &str,
) -> Result<(), PipelineError> {
    match lines.get(cursor) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(apply_error(format!(
            "{path}:{}: {role} line mismatch (expected '{expected}', found '{actual}')",
            cursor + 1
        ))),
        None => Err(apply_error(format!(
            "{path}:{}: {role} line past end of file (expected '{expected}')",
            cursor + 1
        ))),
    }
}

fn apply_error(message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorKind::Apply, message)
}
