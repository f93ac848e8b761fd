//! Per-run artifact directories under `.pipeline/runs/<run-id>/`.
//!
//! Artifacts are write-once: each name is produced by exactly one stage and a
//! second write is an error. The terminal files (lifecycle state, manifest,
//! integrity verdict) are the exception and are replaced atomically so a
//! reader never sees a torn file.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::contract::IntegrityStatus;
use crate::core::lifecycle::LifecycleState;
use crate::io::atomic::{write_atomic, write_json_atomic};

pub const TASK: &str = "task.txt";
pub const BRANCHES: &str = "branches.json";
pub const RESEARCH: &str = "research.md";
pub const DESIGN: &str = "design.md";
pub const PLAN: &str = "plan.md";
pub const IMPACTED_FILES: &str = "impacted_files.json";
pub const CONTRACT_BASELINE: &str = "contract_baseline.json";
pub const CONTRACT_INTEGRITY: &str = "contract_integrity.json";
pub const CONTRACT_PLACEHOLDER_TESTS: &str = "contract_placeholder_tests.md";
pub const LIFECYCLE_STATE: &str = "lifecycle_state.txt";
pub const RUN_MANIFEST: &str = "run_manifest.json";

const REWRITABLE: &[&str] = &[LIFECYCLE_STATE, RUN_MANIFEST, CONTRACT_INTEGRITY];
const RUN_ID_PREFIX: &str = "run-";

/// Artifacts produced once per implement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFile {
    Prompt,
    Diff,
    RejectedDiff,
    RejectedReason,
    Scan,
    Regression,
    Contract,
    ValidateLog,
    Validation,
}

impl AttemptFile {
    pub fn name(self, attempt: u32) -> String {
        match self {
            AttemptFile::Prompt => format!("prompt-attempt-{attempt}.md"),
            AttemptFile::Diff => format!("attempt-{attempt}.diff"),
            AttemptFile::RejectedDiff => format!("attempt-{attempt}.rejected.diff"),
            AttemptFile::RejectedReason => format!("attempt-{attempt}.rejected.txt"),
            AttemptFile::Scan => format!("scan-attempt-{attempt}.json"),
            AttemptFile::Regression => format!("regression-attempt-{attempt}.json"),
            AttemptFile::Contract => format!("contract-attempt-{attempt}.json"),
            AttemptFile::ValidateLog => format!("validate-attempt-{attempt}.log"),
            AttemptFile::Validation => format!("validation-attempt-{attempt}.json"),
        }
    }
}

/// Base and task branch names recorded at run start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub base_branch: String,
    pub base_commit: String,
    pub task_branch: String,
}

/// Final (and in-progress) summary of a run, rewritten at every terminal
/// transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub run_id: String,
    pub task: String,
    pub base_branch: String,
    pub base_commit: String,
    pub task_branch: String,
    pub lifecycle_state: LifecycleState,
    pub attempts: u32,
    pub max_retries: u32,
    pub retry_count: u32,
    pub contract_hash_before: Option<String>,
    pub contract_hash_after: Option<String>,
    pub contract_integrity_status: IntegrityStatus,
    pub validate_exit_code: Option<i32>,
    pub changed_files: Vec<String>,
    pub reason: Option<String>,
    pub rollback_completed: bool,
    pub finished_at: Option<String>,
}

/// Handle to one run's artifact directory.
#[derive(Debug, Clone)]
pub struct RunArtifactStore {
    run_id: String,
    dir: PathBuf,
}

impl RunArtifactStore {
    /// Allocate a fresh run directory stamped with the current time.
    pub fn create(runs_dir: &Path) -> Result<Self> {
        Self::create_at(runs_dir, Utc::now())
    }

    /// Allocate a run directory for `now`, suffixing `-2`, `-3`, ... when the
    /// stamp is already taken.
    pub fn create_at(runs_dir: &Path, now: DateTime<Utc>) -> Result<Self> {
        fs::create_dir_all(runs_dir)
            .with_context(|| format!("create directory {}", runs_dir.display()))?;
        let stamp = format!("{RUN_ID_PREFIX}{}", now.format("%Y%m%dT%H%M%S%3f"));
        for n in 1u32.. {
            let run_id = if n == 1 {
                stamp.clone()
            } else {
                format!("{stamp}-{n}")
            };
            let dir = runs_dir.join(&run_id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(run_id = %run_id, "run directory created");
                    return Ok(Self { run_id, dir });
                }
                Err(err) if err.kind() == IoErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create run dir {}", dir.display()));
                }
            }
        }
        Err(anyhow!("no free run id for stamp {stamp}"))
    }

    /// Open an existing run directory for reading.
    pub fn open(runs_dir: &Path, run_id: &str) -> Result<Self> {
        let dir = runs_dir.join(run_id);
        if !dir.is_dir() {
            return Err(anyhow!("run directory {} not found", dir.display()));
        }
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn write_text(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path(name);
        if REWRITABLE.contains(&name) {
            write_atomic(&path, contents.as_bytes())?;
            return Ok(path);
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::AlreadyExists => {
                return Err(anyhow!(
                    "artifact {name} already written for run {}",
                    self.run_id
                ));
            }
            Err(err) => return Err(err).with_context(|| format!("create {}", path.display())),
        };
        file.write_all(contents.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        if REWRITABLE.contains(&name) {
            let path = self.path(name);
            write_json_atomic(&path, value)?;
            return Ok(path);
        }
        let mut buf = serde_json::to_string_pretty(value)
            .with_context(|| format!("serialize artifact {name}"))?;
        buf.push('\n');
        self.write_text(name, &buf)
    }

    pub fn read_text(&self, name: &str) -> Result<Option<String>> {
        let path = self.path(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    pub fn write_lifecycle_state(&self, state: LifecycleState) -> Result<()> {
        self.write_text(LIFECYCLE_STATE, &format!("{state}\n"))?;
        Ok(())
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<()> {
        self.write_json(RUN_MANIFEST, manifest)?;
        Ok(())
    }

    pub fn read_manifest(&self) -> Result<Option<RunManifest>> {
        let Some(text) = self.read_text(RUN_MANIFEST)? else {
            return Ok(None);
        };
        let manifest = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", self.path(RUN_MANIFEST).display()))?;
        Ok(Some(manifest))
    }
}

/// Sorted ids of every run directory under `runs_dir` (empty when the
/// directory does not exist yet).
pub fn list_run_ids(runs_dir: &Path) -> Result<BTreeSet<String>> {
    let entries = match fs::read_dir(runs_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", runs_dir.display())),
    };
    let mut ids = BTreeSet::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", runs_dir.display()))?;
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(RUN_ID_PREFIX)
        {
            ids.insert(name.to_string());
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("time")
    }

    fn manifest(run_id: &str) -> RunManifest {
        RunManifest {
            run_id: run_id.to_string(),
            task: "add health route".to_string(),
            base_branch: "main".to_string(),
            base_commit: "abc".to_string(),
            task_branch: "pipeline/add-health-route-1".to_string(),
            lifecycle_state: LifecycleState::Validating,
            attempts: 1,
            max_retries: 3,
            retry_count: 0,
            contract_hash_before: None,
            contract_hash_after: None,
            contract_integrity_status: IntegrityStatus::Unknown,
            validate_exit_code: None,
            changed_files: Vec::new(),
            reason: None,
            rollback_completed: false,
            finished_at: None,
        }
    }

    #[test]
    fn colliding_stamps_get_suffixes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = RunArtifactStore::create_at(temp.path(), fixed_now()).expect("first");
        let second = RunArtifactStore::create_at(temp.path(), fixed_now()).expect("second");
        assert_eq!(first.run_id(), "run-20260304T050607000");
        assert_eq!(second.run_id(), "run-20260304T050607000-2");

        fs::write(temp.path().join("stray.txt"), "x").expect("stray");
        let ids: Vec<String> = list_run_ids(temp.path()).expect("list").into_iter().collect();
        assert_eq!(ids, vec![first.run_id().to_string(), second.run_id().to_string()]);
    }

    #[test]
    fn artifacts_are_write_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunArtifactStore::create_at(temp.path(), fixed_now()).expect("create");
        store.write_text(PLAN, "edit server/routes.js\n").expect("write");
        let err = store.write_text(PLAN, "again").unwrap_err();
        assert!(err.to_string().contains("already written"));
        assert_eq!(
            store.read_text(PLAN).expect("read").as_deref(),
            Some("edit server/routes.js\n")
        );
        assert_eq!(store.read_text(DESIGN).expect("read"), None);
    }

    #[test]
    fn terminal_files_are_rewritable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunArtifactStore::create_at(temp.path(), fixed_now()).expect("create");
        let mut m = manifest(store.run_id());
        store.write_manifest(&m).expect("first");
        m.lifecycle_state = LifecycleState::Pass;
        store.write_manifest(&m).expect("second");
        store.write_lifecycle_state(LifecycleState::Pass).expect("state");
        store.write_lifecycle_state(LifecycleState::Pass).expect("state again");

        let reopened = RunArtifactStore::open(temp.path(), store.run_id()).expect("open");
        assert_eq!(reopened.read_manifest().expect("read"), Some(m));
        assert_eq!(
            reopened.read_text(LIFECYCLE_STATE).expect("read").as_deref(),
            Some("PASS\n")
        );
    }

    #[test]
    fn manifest_uses_camel_case_fields() {
        let value = serde_json::to_value(manifest("run-1")).expect("json");
        assert_eq!(value["lifecycleState"], "VALIDATING");
        assert_eq!(value["contractIntegrityStatus"], "UNKNOWN");
        assert!(value.get("rollbackCompleted").is_some());
    }

    #[test]
    fn missing_runs_dir_lists_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(list_run_ids(&temp.path().join("none")).expect("list").is_empty());
    }
}
