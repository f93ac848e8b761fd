//! Git adapter for the pipeline.
//!
//! Git is the version-control collaborator: it records base/task branches,
//! holds snapshot refs, and performs every hard reset and cleanup. We keep a
//! small, explicit wrapper around `git` subprocess calls; every failure
//! propagates as an error.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// A ref and the object it points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub name: String,
    pub target: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Resolve `rev` to a commit SHA, or `None` when it does not exist.
    pub fn resolve_commit(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// Ensure the worktree is clean (including untracked files).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty = entries.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-q", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", "-q", branch])?;
        Ok(())
    }

    /// Force-delete a local branch.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-q", "-D", branch])?;
        Ok(())
    }

    /// Move the current branch, index, and worktree to `rev`.
    #[instrument(skip_all, fields(rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        debug!(rev, "hard reset");
        self.run_checked(&["reset", "-q", "--hard", rev])?;
        Ok(())
    }

    /// Unstage everything, keeping worktree contents.
    pub fn reset_index(&self) -> Result<()> {
        self.run_checked(&["reset", "-q"])?;
        Ok(())
    }

    /// Remove untracked files and directories. Ignored files are kept.
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-q", "-f", "-d"])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--quiet"])?;
        Ok(!out.status.success())
    }

    /// Stage everything and commit. Returns `Ok(false)` when nothing changed.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-q", "-m", message])?;
        Ok(true)
    }

    /// `git stash create`: a commit capturing index and worktree without
    /// touching either. `None` when there is nothing to capture.
    pub fn stash_create(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["stash", "create"])?;
        let sha = out.trim();
        Ok((!sha.is_empty()).then(|| sha.to_string()))
    }

    /// Re-apply a stash commit, including its index.
    pub fn stash_apply_index(&self, stash: &str) -> Result<()> {
        self.run_checked(&["stash", "apply", "-q", "--index", stash])?;
        Ok(())
    }

    pub fn update_ref(&self, name: &str, target: &str) -> Result<()> {
        self.run_checked(&["update-ref", name, target])?;
        Ok(())
    }

    pub fn delete_ref(&self, name: &str) -> Result<()> {
        self.run_checked(&["update-ref", "-d", name])?;
        Ok(())
    }

    /// Refs under `prefix`, sorted by name.
    pub fn list_refs(&self, prefix: &str) -> Result<Vec<RefEntry>> {
        let out = self.run_capture(&[
            "for-each-ref",
            "--sort=refname",
            "--format=%(refname) %(objectname)",
            prefix,
        ])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let (name, target) = line
                    .split_once(' ')
                    .ok_or_else(|| anyhow!("unexpected for-each-ref line: '{line}'"))?;
                Ok(RefEntry {
                    name: name.to_string(),
                    target: target.to_string(),
                })
            })
            .collect()
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_and_modified_lines() {
        let untracked = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(untracked.code, "??");
        assert_eq!(untracked.path, "foo.txt");

        let modified = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(modified.code, " M");
        assert_eq!(modified.path, "src/main.rs");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn reset_and_clean_restore_head() {
        let repo = TestRepo::new().expect("repo");
        repo.write("app.js", "changed\n").expect("write");
        repo.write("new/file.js", "x\n").expect("write");
        let git = repo.git();
        assert!(!git.is_clean().expect("status"));

        let head = git.head_sha().expect("head");
        git.reset_hard(&head).expect("reset");
        git.clean_untracked().expect("clean");
        assert!(git.is_clean().expect("status"));
        assert_eq!(repo.read("app.js").expect("read"), TestRepo::APP_JS);
    }

    #[test]
    fn stash_create_is_none_on_clean_tree() {
        let repo = TestRepo::new().expect("repo");
        assert_eq!(repo.git().stash_create().expect("stash"), None);
    }

    #[test]
    fn refs_round_trip() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let head = git.head_sha().expect("head");
        git.update_ref("refs/pipeline/test/a", &head).expect("update");
        let refs = git.list_refs("refs/pipeline/test/").expect("list");
        assert_eq!(
            refs,
            vec![RefEntry {
                name: "refs/pipeline/test/a".to_string(),
                target: head.clone(),
            }]
        );
        assert_eq!(git.resolve_commit("refs/pipeline/test/a").expect("resolve"), Some(head));
        git.delete_ref("refs/pipeline/test/a").expect("delete");
        assert!(git.list_refs("refs/pipeline/test/").expect("list").is_empty());
        assert_eq!(git.resolve_commit("refs/pipeline/test/a").expect("resolve"), None);
    }
}
