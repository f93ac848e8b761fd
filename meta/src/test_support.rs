//! Queue-driven step invoker for controller tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};

use pipeline::io::artifacts::RUN_MANIFEST;

use crate::harness::{StepInvoker, StepRequest};

/// One scripted `pipeline run`: its exit code and, when it got far enough to
/// create a run directory, the manifest it left behind.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub exit_code: Option<i32>,
    pub manifest: Option<Value>,
}

impl ScriptedRun {
    pub fn pass() -> Self {
        Self::with_manifest(
            Some(0),
            json!({
                "lifecycleState": "PASS",
                "contractIntegrityStatus": "PASS",
                "validateExitCode": 0,
                "reason": null
            }),
        )
    }

    pub fn fail() -> Self {
        Self::with_manifest(
            Some(1),
            json!({
                "lifecycleState": "FAILED",
                "contractIntegrityStatus": "PASS",
                "validateExitCode": 1,
                "reason": "VALIDATION_FAILED: validation failed after 3 attempt(s)"
            }),
        )
    }

    /// Exited before creating a run directory.
    pub fn crashed(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            manifest: None,
        }
    }

    pub fn with_manifest(exit_code: Option<i32>, manifest: Value) -> Self {
        Self {
            exit_code,
            manifest: Some(manifest),
        }
    }
}

#[derive(Debug)]
pub struct ScriptedInvoker {
    runs_dir: PathBuf,
    queue: RefCell<VecDeque<ScriptedRun>>,
    tasks: RefCell<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new(runs_dir: &Path, runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            runs_dir: runs_dir.to_path_buf(),
            queue: RefCell::new(runs.into_iter().collect()),
            tasks: RefCell::new(Vec::new()),
        }
    }

    /// Task text of every invocation so far, in order.
    pub fn tasks(&self) -> Vec<String> {
        self.tasks.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let remaining = self.queue.borrow().len();
        if remaining > 0 {
            return Err(anyhow!("scripted invoker has {remaining} unused runs"));
        }
        Ok(())
    }

    fn next_run_dir(&self) -> PathBuf {
        (1u32..)
            .map(|n| self.runs_dir.join(format!("run-test-{n:04}")))
            .find(|dir| !dir.exists())
            .unwrap_or_else(|| self.runs_dir.join("run-test-overflow"))
    }
}

impl StepInvoker for ScriptedInvoker {
    fn invoke(&self, request: &StepRequest) -> Result<Option<i32>> {
        self.tasks.borrow_mut().push(request.task.clone());
        let run = self
            .queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted invoker exhausted at task: {}", request.task))?;
        if let Some(mut manifest) = run.manifest {
            let dir = self.next_run_dir();
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            let run_id = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if let Some(object) = manifest.as_object_mut() {
                object.insert("runId".to_string(), Value::String(run_id));
                object.insert("task".to_string(), Value::String(request.task.clone()));
            }
            let path = dir.join(RUN_MANIFEST);
            fs::write(&path, serde_json::to_vec_pretty(&manifest)?)
                .with_context(|| format!("write {}", path.display()))?;
        }
        Ok(run.exit_code)
    }
}
