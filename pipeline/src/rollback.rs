//! Rollback of a failed run back to its base branch and commit.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::bail_kind;
use crate::core::apply::FileStore;
use crate::core::lifecycle::LifecycleState;
use crate::io::disk_store::DiskStore;
use crate::io::git::Git;
use crate::io::snapshot::{SnapshotManager, attempt_label};
use crate::run::RunContext;

/// Put the workspace back on `base_branch` at `base_commit`.
///
/// Only legal once the run is `FAILED`. Runs at most once per run: later
/// calls return `Ok(false)` and touch nothing.
#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub fn rollback(
    ctx: &mut RunContext,
    git: &Git,
    snapshots: &SnapshotManager,
    keep_task_branch: bool,
) -> Result<bool> {
    if ctx.rollback_completed {
        info!("rollback already completed");
        return Ok(false);
    }
    if ctx.lifecycle.current() != LifecycleState::Failed {
        bail_kind!(
            Guard,
            "rollback requires FAILED, lifecycle is {}",
            ctx.lifecycle.current()
        );
    }

    if let Some(label) = ctx.active_snapshot.take()
        && let Err(err) = snapshots.restore(&label)
    {
        warn!(label = %label, err = %format!("{err:#}"), "snapshot restore failed during rollback");
    }
    restore_bookkeeping(ctx, git.workdir())?;

    if let Err(err) = git.checkout_branch(&ctx.base_branch) {
        warn!(err = %format!("{err:#}"), "checkout of base branch failed, forcing workspace");
        git.reset_hard(&ctx.base_commit)
            .context("force workspace to base commit")?;
        git.clean_untracked().context("remove untracked files")?;
        git.checkout_branch(&ctx.base_branch)
            .with_context(|| format!("checkout {} after forcing workspace", ctx.base_branch))?;
    }
    git.reset_hard(&ctx.base_commit)
        .with_context(|| format!("reset to base commit {}", ctx.base_commit))?;
    git.clean_untracked().context("remove untracked files")?;
    if let Err(err) = git.ensure_clean() {
        bail_kind!(Workspace, "workspace dirty after rollback: {err:#}");
    }

    if keep_task_branch {
        info!(branch = %ctx.task_branch, "keeping failed task branch");
    } else if ctx.task_branch != ctx.base_branch && git.branch_exists(&ctx.task_branch)? {
        git.delete_branch(&ctx.task_branch)?;
    }

    for attempt in 1..=ctx.attempt {
        snapshots.drop(&attempt_label(attempt))?;
    }

    ctx.rollback_completed = true;
    info!(base = %ctx.base_branch, "rollback completed");
    Ok(true)
}

/// Put back files the active attempt wrote under always-allowed directories.
/// `git reset` and `git clean` skip them because they are ignored.
pub(crate) fn restore_bookkeeping(ctx: &mut RunContext, root: &Path) -> Result<()> {
    let mut disk = DiskStore::new(root);
    for (path, original) in std::mem::take(&mut ctx.bookkeeping_originals) {
        match original {
            Some(contents) => disk.write(&path, &contents),
            None => disk.remove(&path),
        }
        .with_context(|| format!("restore {path}"))?;
        debug!(path = %path, "bookkeeping file restored");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, kind_of};
    use crate::io::init::ensure_layout;
    use crate::test_support::TestRepo;

    fn failed_run(repo: &TestRepo) -> (RunContext, SnapshotManager) {
        let git = repo.git();
        let base_commit = git.head_sha().expect("head");
        git.checkout_new_branch("pipeline/demo-1").expect("branch");
        let mut ctx = RunContext::new(
            "run-1",
            "demo",
            "main",
            &base_commit,
            "pipeline/demo-1",
            3,
        );
        let snapshots = SnapshotManager::new(git);
        snapshots.create(&attempt_label(1)).expect("snapshot");
        ctx.active_snapshot = Some(attempt_label(1));
        repo.write("app.js", "half-applied\n").expect("write");
        repo.write("server/new.js", "stray\n").expect("write");
        ctx.lifecycle.abort().expect("abort");
        (ctx, snapshots)
    }

    #[test]
    fn restores_base_and_deletes_task_branch() {
        let repo = TestRepo::new().expect("repo");
        let (mut ctx, snapshots) = failed_run(&repo);

        assert!(rollback(&mut ctx, &repo.git(), &snapshots, false).expect("rollback"));

        let git = repo.git();
        assert_eq!(git.current_branch().expect("branch"), "main");
        assert_eq!(git.head_sha().expect("head"), ctx.base_commit);
        assert_eq!(repo.read("app.js").expect("read"), TestRepo::APP_JS);
        assert!(!repo.exists("server/new.js"));
        assert!(!git.branch_exists("pipeline/demo-1").expect("exists"));
        assert!(snapshots.labels().expect("labels").is_empty());
        assert!(ctx.rollback_completed);
    }

    #[test]
    fn undoes_attempt_writes_under_ignored_dirs() {
        let repo = TestRepo::new().expect("repo");
        ensure_layout(repo.path()).expect("layout");
        repo.write(".pipeline/todo.md", "open\n").expect("write");
        let (mut ctx, snapshots) = failed_run(&repo);
        ctx.bookkeeping_originals
            .insert(".pipeline/todo.md".to_string(), Some("open\n".to_string()));
        ctx.bookkeeping_originals
            .insert(".pipeline/scratch/notes.md".to_string(), None);
        repo.write(".pipeline/todo.md", "done\n").expect("write");
        repo.write(".pipeline/scratch/notes.md", "stray\n").expect("write");

        rollback(&mut ctx, &repo.git(), &snapshots, false).expect("rollback");

        assert_eq!(repo.read(".pipeline/todo.md").expect("read"), "open\n");
        assert!(!repo.exists(".pipeline/scratch/notes.md"));
        assert!(!repo.exists(".pipeline/scratch"));
        assert!(ctx.bookkeeping_originals.is_empty());
    }

    #[test]
    fn second_rollback_is_a_no_op() {
        let repo = TestRepo::new().expect("repo");
        let (mut ctx, snapshots) = failed_run(&repo);
        rollback(&mut ctx, &repo.git(), &snapshots, false).expect("first");
        let head = repo.git().head_sha().expect("head");

        assert!(!rollback(&mut ctx, &repo.git(), &snapshots, false).expect("second"));
        assert_eq!(repo.git().head_sha().expect("head"), head);
        assert!(repo.git().is_clean().expect("clean"));
    }

    #[test]
    fn keeps_branch_when_asked() {
        let repo = TestRepo::new().expect("repo");
        let (mut ctx, snapshots) = failed_run(&repo);
        rollback(&mut ctx, &repo.git(), &snapshots, true).expect("rollback");
        assert!(repo.git().branch_exists("pipeline/demo-1").expect("exists"));
    }

    #[test]
    fn refuses_non_failed_runs() {
        let repo = TestRepo::new().expect("repo");
        let mut ctx = RunContext::new("run-1", "demo", "main", "abc", "pipeline/demo-1", 3);
        let snapshots = SnapshotManager::new(repo.git());
        let err = rollback(&mut ctx, &repo.git(), &snapshots, false).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Guard));
        assert!(!ctx.rollback_completed);
    }
}
