//! Named, restorable captures of uncommitted workspace state.
//!
//! A snapshot for `<label>` is stored as refs under
//! `refs/pipeline/snapshots/<label>/`:
//!
//! - `head`: the commit HEAD pointed to when the snapshot was taken.
//! - `state`: a `git stash create` commit of the index and worktree, built
//!   after `git add -A` so new files are captured. Absent when the workspace
//!   matched `head` exactly.
//!
//! Restoring hard-resets to `head`, removes untracked files, and re-applies
//! `state`. Ignored files (including `.pipeline/`) are never touched.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::bail_kind;
use crate::io::git::Git;

pub const SNAPSHOT_REF_ROOT: &str = "refs/pipeline/snapshots";

/// Label used for the snapshot of implement attempt `attempt`.
pub fn attempt_label(attempt: u32) -> String {
    format!("attempt-{attempt}")
}

/// Resolved refs for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub label: String,
    pub head: String,
    pub state: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    git: Git,
}

impl SnapshotManager {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    fn prefix(label: &str) -> String {
        format!("{SNAPSHOT_REF_ROOT}/{label}/")
    }

    /// Capture the current workspace under `label`. Errors when the label is
    /// already taken.
    #[instrument(skip_all, fields(label = label))]
    pub fn create(&self, label: &str) -> Result<Snapshot> {
        if label.is_empty() || label.contains(['/', ' ', '~', '^', ':']) {
            bail_kind!(Workspace, "invalid snapshot label '{label}'");
        }
        if self.find(label)?.is_some() {
            bail_kind!(Workspace, "snapshot '{label}' already exists");
        }

        let head = self.git.head_sha().context("snapshot head")?;
        self.git.add_all().context("stage workspace for snapshot")?;
        let state = self.git.stash_create().context("create snapshot state")?;
        self.git.reset_index().context("unstage after snapshot")?;

        let prefix = Self::prefix(label);
        self.git.update_ref(&format!("{prefix}head"), &head)?;
        if let Some(state) = &state {
            self.git.update_ref(&format!("{prefix}state"), state)?;
        }
        info!(label, head = %head, has_state = state.is_some(), "snapshot created");
        Ok(Snapshot {
            label: label.to_string(),
            head,
            state,
        })
    }

    /// Look up a snapshot by label.
    pub fn find(&self, label: &str) -> Result<Option<Snapshot>> {
        let prefix = Self::prefix(label);
        let refs = self.git.list_refs(&prefix)?;
        let mut head = None;
        let mut state = None;
        for entry in refs {
            match entry.name.strip_prefix(&prefix) {
                Some("head") => head = Some(entry.target),
                Some("state") => state = Some(entry.target),
                _ => {}
            }
        }
        Ok(head.map(|head| Snapshot {
            label: label.to_string(),
            head,
            state,
        }))
    }

    /// Labels of every snapshot present, sorted.
    pub fn labels(&self) -> Result<Vec<String>> {
        let root = format!("{SNAPSHOT_REF_ROOT}/");
        let mut labels: Vec<String> = self
            .git
            .list_refs(&root)?
            .into_iter()
            .filter_map(|entry| {
                let rest = entry.name.strip_prefix(&root)?;
                let (label, _) = rest.split_once('/')?;
                Some(label.to_string())
            })
            .collect();
        labels.dedup();
        Ok(labels)
    }

    /// Put the workspace back exactly as it was when `label` was taken.
    #[instrument(skip_all, fields(label = label))]
    pub fn restore(&self, label: &str) -> Result<()> {
        let Some(snapshot) = self.find(label)? else {
            bail_kind!(Workspace, "snapshot '{label}' not found");
        };
        self.git
            .reset_hard(&snapshot.head)
            .with_context(|| format!("reset to snapshot '{label}'"))?;
        self.git
            .clean_untracked()
            .with_context(|| format!("clean for snapshot '{label}'"))?;
        if let Some(state) = &snapshot.state {
            self.git
                .stash_apply_index(state)
                .with_context(|| format!("apply snapshot '{label}' state"))?;
            self.git.reset_index()?;
        }
        info!(label, "snapshot restored");
        Ok(())
    }

    /// Delete the refs for `label`. Missing snapshots are tolerated.
    #[instrument(skip_all, fields(label = label))]
    pub fn drop(&self, label: &str) -> Result<bool> {
        let prefix = Self::prefix(label);
        let refs = self.git.list_refs(&prefix)?;
        if refs.is_empty() {
            debug!(label, "snapshot already dropped");
            return Ok(false);
        }
        for entry in refs {
            if let Err(err) = self.git.delete_ref(&entry.name) {
                warn!(ref_name = %entry.name, err = %err, "failed to delete snapshot ref");
                return Err(err);
            }
        }
        debug!(label, "snapshot dropped");
        Ok(true)
    }
}
